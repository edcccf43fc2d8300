//! Recursive-descent parser: token stream -> [`crate::ast`].
//!
//! Precedence, low to high: ternary `if/else`, `or`, `and`, `not`, compare
//! (`==`,`!=`,`<`,`<=`,`>`,`>=`,`in`,`not in`,`is`), `~` concat, `+`/`-`,
//! `*`/`/`/`//`/`%`, unary `-`, `**`, postfix (`.attr`, `[item]`, `(call)`,
//! `|filter`).

use crate::ast::*;
use crate::error::{Error, ErrorKind};
use crate::lexer::{Lexer, Span, Token};
use crate::value::Value;

pub fn parse(source: &str, filename: &str) -> Result<Ast, Error> {
    let tokens = Lexer::new(source)
        .tokenize()
        .map_err(|e| tag_filename(e, filename))?;
    let mut parser = Parser { tokens, pos: 0, filename: filename.to_string() };
    let body = parser.parse_body(&[])?.0;
    Ok(Ast { body })
}

fn tag_filename(mut err: Error, filename: &str) -> Error {
    err.set_location(filename, 0);
    err
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    filename: String,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.pos).map(|(_, s)| s.start_line).unwrap_or(0)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        let mut e = Error::new(ErrorKind::TemplateSyntaxError, msg.into());
        e.set_location(&self.filename, self.line() as usize);
        e
    }

    fn expect(&mut self, tok: &Token) -> Result<(), Error> {
        match self.peek() {
            Some(t) if t == tok => {
                self.bump();
                Ok(())
            }
            Some(other) => Err(self.err(format!("expected {tok}, found {other}"))),
            None => Err(self.err(format!("expected {tok}, found end of input"))),
        }
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i == name)
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.is_ident(name) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, Error> {
        match self.bump() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }

    fn expect_ident_value(&mut self, name: &str) -> Result<(), Error> {
        if self.eat_ident(name) {
            Ok(())
        } else {
            Err(self.err(format!("expected keyword `{name}`")))
        }
    }

    // ---- statement-level parsing -----------------------------------

    /// Parses statements until a `{% <kw> %}` where `<kw>` is in `stop` is
    /// seen (that tag is *not* consumed), or input ends (only valid when
    /// `stop` is empty, i.e. top level). Returns the body and the keyword
    /// that stopped it, if any.
    fn parse_body(&mut self, stop: &[&str]) -> Result<(Body, Option<String>), Error> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                None => {
                    if stop.is_empty() {
                        return Ok((body, None));
                    }
                    return Err(self.err(format!(
                        "unexpected end of input, expected one of: {}",
                        stop.join(", ")
                    )));
                }
                Some(Token::TemplateData(_)) => {
                    let line = self.line();
                    if let Some(Token::TemplateData(text)) = self.bump() {
                        if !text.is_empty() {
                            body.push(Stmt::EmitRaw(Spanned::new(text, line)));
                        }
                    }
                }
                Some(Token::VariableStart(_)) => {
                    self.bump();
                    let line = self.line();
                    let expr = self.parse_expression()?;
                    match self.bump() {
                        Some(Token::VariableEnd(_)) => {}
                        other => return Err(self.err(format!("expected `}}}}`, found {:?}", other))),
                    }
                    body.push(Stmt::EmitExpr(Spanned::new(expr, line)));
                }
                Some(Token::BlockStart(_)) => {
                    // peek the keyword without consuming BlockStart yet
                    let kw = match self.tokens.get(self.pos + 1) {
                        Some((Token::Ident(i), _)) => i.clone(),
                        _ => return Err(self.err("expected a tag name after `{%`")),
                    };
                    if stop.contains(&kw.as_str()) {
                        self.bump(); // BlockStart
                        self.bump(); // keyword ident
                        return Ok((body, Some(kw)));
                    }
                    self.bump(); // BlockStart
                    let line = self.line();
                    let stmt = self.parse_tag(&kw, line)?;
                    body.push(stmt);
                }
                Some(other) => return Err(self.err(format!("unexpected token {other}"))),
            }
        }
    }

    fn parse_tag(&mut self, kw: &str, line: u32) -> Result<Stmt, Error> {
        self.bump(); // the keyword ident
        match kw {
            "if" => self.parse_if(line),
            "for" => self.parse_for(line),
            "set" => self.parse_set(line),
            "block" => self.parse_block(line),
            "autoescape" => self.parse_autoescape(line),
            "filter" => self.parse_filter_block(line),
            "with" => self.parse_with(line),
            "do" => {
                let expr = self.parse_expression()?;
                self.end_tag()?;
                Ok(Stmt::Do(Spanned::new(expr, line)))
            }
            "extends" => {
                let expr = self.parse_expression()?;
                self.end_tag()?;
                Ok(Stmt::Extends(Spanned::new(expr, line)))
            }
            "include" => self.parse_include(line),
            "import" => self.parse_import(line),
            "from" => self.parse_from_import(line),
            "macro" => self.parse_macro(line),
            "call" => self.parse_call_block(line),
            "trans" => self.parse_trans(line),
            "export" => self.parse_export(line),
            "break" => {
                self.end_tag()?;
                Ok(Stmt::Break(line))
            }
            "continue" => {
                self.end_tag()?;
                Ok(Stmt::Continue(line))
            }
            "raw" => self.parse_raw(line),
            other => Err(self.err(format!("unknown tag `{other}`"))),
        }
    }

    fn end_tag(&mut self) -> Result<(), Error> {
        match self.bump() {
            Some(Token::BlockEnd(_)) => Ok(()),
            other => Err(self.err(format!("expected `%}}`, found {:?}", other))),
        }
    }

    fn parse_raw(&mut self, line: u32) -> Result<Stmt, Error> {
        self.end_tag()?;
        let text = match self.bump() {
            Some(Token::TemplateData(s)) => s,
            Some(Token::BlockStart(_)) => String::new(),
            other => return Err(self.err(format!("malformed raw block: {:?}", other))),
        };
        if matches!(self.peek(), Some(Token::BlockStart(_))) {
            self.bump();
        }
        self.expect_ident_value("endraw")?;
        self.end_tag()?;
        Ok(Stmt::EmitRaw(Spanned::new(text, line)))
    }

    fn parse_if(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut branches = Vec::new();
        let mut cond = self.parse_expression()?;
        loop {
            self.end_tag()?;
            let (body, stopper) = self.parse_body(&["elif", "else", "endif"])?;
            branches.push((cond.clone(), body));
            match stopper.as_deref() {
                Some("elif") => {
                    cond = self.parse_expression()?;
                    continue;
                }
                Some("else") => {
                    self.end_tag()?;
                    let (else_body, _) = self.parse_body(&["endif"])?;
                    self.end_tag()?;
                    return Ok(Stmt::If(Spanned::new(IfCond { branches, else_body }, line)));
                }
                Some("endif") => {
                    self.end_tag()?;
                    return Ok(Stmt::If(Spanned::new(IfCond { branches, else_body: Vec::new() }, line)));
                }
                _ => return Err(self.err("malformed if statement")),
            }
        }
    }

    fn parse_for(&mut self, line: u32) -> Result<Stmt, Error> {
        let target = self.parse_assign_target()?;
        self.expect_ident_value("in")?;
        let iter = self.parse_or()?;
        let filter_expr = if self.eat_ident("if") {
            Some(self.parse_or()?)
        } else {
            None
        };
        let recursive = self.eat_ident("recursive");
        self.end_tag()?;
        let (body, stopper) = self.parse_body(&["else", "endfor"])?;
        let else_body = if stopper.as_deref() == Some("else") {
            self.end_tag()?;
            let (b, _) = self.parse_body(&["endfor"])?;
            self.end_tag()?;
            b
        } else {
            self.end_tag()?;
            Vec::new()
        };
        Ok(Stmt::For(Spanned::new(
            ForLoop { target, iter, filter_expr, recursive, body, else_body },
            line,
        )))
    }

    fn parse_assign_target(&mut self) -> Result<AssignTarget, Error> {
        let first = self.parse_assign_atom()?;
        if matches!(self.peek(), Some(Token::Comma)) {
            let mut items = vec![first];
            while self.eat(&Token::Comma) {
                if matches!(self.peek(), Some(Token::Ident(i)) if i == "in") {
                    break;
                }
                items.push(self.parse_assign_atom()?);
            }
            return Ok(AssignTarget::Tuple(items));
        }
        Ok(first)
    }

    fn parse_assign_atom(&mut self) -> Result<AssignTarget, Error> {
        if self.eat(&Token::ParenOpen) {
            let t = self.parse_assign_target()?;
            self.expect(&Token::ParenClose)?;
            return Ok(t);
        }
        let name = self.expect_ident()?;
        let mut target = AssignTarget::Name(name);
        loop {
            if self.eat(&Token::Dot) {
                let attr = self.expect_ident()?;
                let expr = assign_target_to_expr(target);
                target = AssignTarget::Attr { expr: Box::new(expr), name: attr };
            } else if self.eat(&Token::BracketOpen) {
                let idx = self.parse_expression()?;
                self.expect(&Token::BracketClose)?;
                let expr = assign_target_to_expr(target);
                target = AssignTarget::Item { expr: Box::new(expr), index: Box::new(idx) };
            } else {
                break;
            }
        }
        Ok(target)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn parse_set(&mut self, line: u32) -> Result<Stmt, Error> {
        let target = self.parse_assign_target()?;
        if self.eat(&Token::Assign) {
            let expr = self.parse_expression()?;
            self.end_tag()?;
            return Ok(Stmt::Set(Spanned::new(Set { target, expr }, line)));
        }
        let filter = if self.eat(&Token::Pipe) {
            Some(self.parse_filter_chain(None)?)
        } else {
            None
        };
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endset"])?;
        self.end_tag()?;
        Ok(Stmt::SetBlock(Spanned::new(SetBlock { target, filter, body }, line)))
    }

    fn parse_block(&mut self, line: u32) -> Result<Stmt, Error> {
        let name = self.expect_ident()?;
        let scoped = self.eat_ident("scoped");
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endblock"])?;
        self.bump_optional_ident();
        self.end_tag()?;
        Ok(Stmt::Block(Spanned::new(Block { name, scoped, body }, line)))
    }

    fn bump_optional_ident(&mut self) {
        if matches!(self.peek(), Some(Token::Ident(_))) {
            self.bump();
        }
    }

    fn parse_autoescape(&mut self, line: u32) -> Result<Stmt, Error> {
        let enabled = self.parse_expression()?;
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endautoescape"])?;
        self.end_tag()?;
        Ok(Stmt::AutoEscape(Spanned::new(AutoEscape { enabled, body }, line)))
    }

    fn parse_filter_block(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut filters = vec![self.parse_one_filter()?];
        while self.eat(&Token::Pipe) {
            filters.push(self.parse_one_filter()?);
        }
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endfilter"])?;
        self.end_tag()?;
        Ok(Stmt::FilterBlock(Spanned::new(FilterBlock { filters, body }, line)))
    }

    fn parse_one_filter(&mut self) -> Result<(String, Vec<Expr>, Vec<(String, Expr)>), Error> {
        let name = self.expect_ident()?;
        let (args, kwargs) = if self.eat(&Token::ParenOpen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        Ok((name, args, kwargs))
    }

    fn parse_with(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut assignments = Vec::new();
        if !matches!(self.peek(), Some(Token::BlockEnd(_))) {
            loop {
                let target = self.parse_assign_target()?;
                self.expect(&Token::Assign)?;
                let expr = self.parse_expression()?;
                assignments.push((target, expr));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endwith"])?;
        self.end_tag()?;
        Ok(Stmt::With(Spanned::new(With { assignments, body }, line)))
    }

    fn parse_include(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut names = vec![self.parse_or()?];
        while self.eat_ident("or") {
            names.push(self.parse_or()?);
        }
        let mut ignore_missing = false;
        if self.eat_ident("ignore") {
            self.expect_ident_value("missing")?;
            ignore_missing = true;
        }
        let with_context = if self.eat_ident("without") {
            self.expect_ident_value("context")?;
            false
        } else if self.eat_ident("with") {
            self.expect_ident_value("context")?;
            true
        } else {
            true
        };
        self.end_tag()?;
        Ok(Stmt::Include(Spanned::new(
            Include { names, ignore_missing, with_context },
            line,
        )))
    }

    fn parse_import(&mut self, line: u32) -> Result<Stmt, Error> {
        let expr = self.parse_or()?;
        self.expect_ident_value("as")?;
        let name = self.expect_ident()?;
        let with_context = self.parse_optional_context();
        self.end_tag()?;
        Ok(Stmt::Import(Spanned::new(Import { expr, name, with_context }, line)))
    }

    fn parse_from_import(&mut self, line: u32) -> Result<Stmt, Error> {
        let expr = self.parse_or()?;
        self.expect_ident_value("import")?;
        let names = if self.eat(&Token::Mul) {
            None
        } else {
            let mut list = Vec::new();
            loop {
                let n = self.expect_ident()?;
                let alias = if self.eat_ident("as") { Some(self.expect_ident()?) } else { None };
                list.push((n, alias));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            Some(list)
        };
        let with_context = self.parse_optional_context();
        self.end_tag()?;
        Ok(Stmt::FromImport(Spanned::new(FromImport { expr, names, with_context }, line)))
    }

    fn parse_optional_context(&mut self) -> bool {
        if self.eat_ident("without") {
            self.eat_ident("context");
            false
        } else if self.eat_ident("with") {
            self.eat_ident("context");
            true
        } else {
            false
        }
    }

    fn parse_macro(&mut self, line: u32) -> Result<Stmt, Error> {
        let name = self.expect_ident()?;
        self.expect(&Token::ParenOpen)?;
        let mut params = Vec::new();
        let mut defaults = Vec::new();
        let mut kwonly_params = Vec::new();
        let mut kwonly_defaults = Vec::new();
        let mut has_varargs = false;
        let mut has_kwargs = false;
        let mut kwonly_mode = false;
        while !matches!(self.peek(), Some(Token::ParenClose)) {
            if self.eat(&Token::Mul) {
                if self.eat(&Token::Mul) {
                    // `**kwargs`
                    self.expect_ident()?;
                    has_kwargs = true;
                } else if matches!(self.peek(), Some(Token::Ident(_))) {
                    self.expect_ident()?;
                    has_varargs = true;
                } else {
                    kwonly_mode = true;
                }
            } else {
                let pname = self.expect_ident()?;
                let default = if self.eat(&Token::Assign) {
                    Some(self.parse_or()?)
                } else {
                    None
                };
                if kwonly_mode {
                    kwonly_params.push(pname);
                    kwonly_defaults.push(default);
                } else {
                    params.push(pname);
                    defaults.push(default);
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::ParenClose)?;
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endmacro"])?;
        self.end_tag()?;
        let references_caller = body_references_caller(&body);
        Ok(Stmt::Macro(Spanned::new(
            MacroDef {
                name,
                params,
                defaults,
                kwonly_params,
                kwonly_defaults,
                has_varargs,
                has_kwargs,
                body,
                references_caller,
            },
            line,
        )))
    }

    fn parse_call_block(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut caller_params = Vec::new();
        let mut caller_defaults = Vec::new();
        if self.eat(&Token::ParenOpen) {
            while !matches!(self.peek(), Some(Token::ParenClose)) {
                let pname = self.expect_ident()?;
                let default = if self.eat(&Token::Assign) { Some(self.parse_or()?) } else { None };
                caller_params.push(pname);
                caller_defaults.push(default);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::ParenClose)?;
        }
        let call = self.parse_or()?;
        self.end_tag()?;
        let (body, _) = self.parse_body(&["endcall"])?;
        self.end_tag()?;
        Ok(Stmt::CallBlock(Spanned::new(CallBlock { caller_params, caller_defaults, call, body }, line)))
    }

    fn parse_trans(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut trimmed = if self.eat_ident("trimmed") { Some(true) } else { None };
        if trimmed.is_none() && self.eat_ident("notrimmed") {
            trimmed = Some(false);
        }
        let mut context = None;
        if self.eat_ident("context") {
            match self.parse_or()? {
                Expr::Const(Value::Str(s)) => context = Some(s.to_string()),
                _ => return Err(Error::new(ErrorKind::TemplateSyntaxError, "`trans context` expects a string literal")),
            }
        }
        let mut vars = Vec::new();
        if !matches!(self.peek(), Some(Token::BlockEnd(_))) {
            loop {
                let n = self.expect_ident()?;
                self.expect(&Token::Assign)?;
                let e = self.parse_or()?;
                vars.push((n, e));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.end_tag()?;
        let (singular_body, stopper) = self.parse_body(&["pluralize", "endtrans"])?;
        let singular = body_to_trans_parts(&singular_body, &self.filename)?;
        let plural = if stopper.as_deref() == Some("pluralize") {
            let pvar = if matches!(self.peek(), Some(Token::Ident(_))) {
                Some(self.expect_ident()?)
            } else {
                None
            };
            self.end_tag()?;
            let (plural_body, _) = self.parse_body(&["endtrans"])?;
            self.end_tag()?;
            Some((pvar.unwrap_or_else(|| "count".to_string()), body_to_trans_parts(&plural_body, &self.filename)?))
        } else {
            self.end_tag()?;
            None
        };
        Ok(Stmt::Trans(Spanned::new(Trans { vars, singular, plural, context, trimmed }, line)))
    }

    fn parse_export(&mut self, line: u32) -> Result<Stmt, Error> {
        let mut names = vec![self.expect_ident()?];
        while self.eat(&Token::Comma) {
            names.push(self.expect_ident()?);
        }
        self.end_tag()?;
        Ok(Stmt::Export(Spanned::new(names, line)))
    }

    // ---- expression-level parsing -----------------------------------

    fn parse_expression(&mut self) -> Result<Expr, Error> {
        let expr = self.parse_or()?;
        if self.eat_ident("if") {
            let test = self.parse_or()?;
            let false_expr = if self.eat_ident("else") {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            return Ok(Expr::IfExpr { test: Box::new(test), true_expr: Box::new(expr), false_expr });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_and()?;
        while self.eat_ident("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_not()?;
        while self.eat_ident("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, Error> {
        if self.eat_ident("not") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, Error> {
        let left = self.parse_concat()?;
        let mut ops = Vec::new();
        loop {
            let op = if self.eat(&Token::Eq) {
                CompareOp::Eq
            } else if self.eat(&Token::Ne) {
                CompareOp::Ne
            } else if self.eat(&Token::Lt) {
                CompareOp::Lt
            } else if self.eat(&Token::Lte) {
                CompareOp::Le
            } else if self.eat(&Token::Gt) {
                CompareOp::Gt
            } else if self.eat(&Token::Gte) {
                CompareOp::Ge
            } else if self.is_ident("in") {
                self.bump();
                CompareOp::In
            } else if self.is_ident("not") && self.peek_is_ident_ahead(1, "in") {
                self.bump();
                self.bump();
                CompareOp::NotIn
            } else if self.eat_ident("is") {
                if !ops.is_empty() {
                    return Err(self.err("`is` cannot appear in a chained comparison"));
                }
                let negated = self.eat_ident("not");
                let name = self.expect_ident()?;
                let (args, kwargs) = if self.eat(&Token::ParenOpen) {
                    self.parse_call_args()?
                } else if matches!(self.peek(), Some(t) if is_atom_start(t))
                    || matches!(self.peek(), Some(Token::Ident(i)) if !is_keyword(i))
                {
                    (vec![self.parse_concat()?], Vec::new())
                } else {
                    (Vec::new(), Vec::new())
                };
                return Ok(Expr::Test { name, expr: Box::new(left), args, kwargs, negated });
            } else {
                break;
            };
            let right = self.parse_concat()?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare { left: Box::new(left), ops })
        }
    }

    fn peek_is_ident_ahead(&self, offset: usize, name: &str) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some((Token::Ident(i), _)) if i == name)
    }

    fn parse_concat(&mut self) -> Result<Expr, Error> {
        let first = self.parse_add()?;
        if matches!(self.peek(), Some(Token::Tilde)) {
            let mut parts = vec![first];
            while self.eat(&Token::Tilde) {
                parts.push(self.parse_add()?);
            }
            return Ok(Expr::Concat(parts));
        }
        Ok(first)
    }

    fn parse_add(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_mul()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                BinOpKind::Add
            } else if self.eat(&Token::Minus) {
                BinOpKind::Sub
            } else {
                break;
            };
            let right = self.parse_mul()?;
            left = Expr::BinOp { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, Error> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat(&Token::Mul) {
                BinOpKind::Mul
            } else if self.eat(&Token::FloorDiv) {
                BinOpKind::FloorDiv
            } else if self.eat(&Token::Div) {
                BinOpKind::Div
            } else if self.eat(&Token::Mod) {
                BinOpKind::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::BinOp { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::UnaryOp { op: UnaryOpKind::Neg, expr: Box::new(self.parse_unary()?) });
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Expr, Error> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::Pow) {
            let exp = self.parse_unary()?;
            return Ok(Expr::BinOp { op: BinOpKind::Pow, left: Box::new(base), right: Box::new(exp) });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_ident()?;
                expr = Expr::GetAttr { expr: Box::new(expr), name };
            } else if self.eat(&Token::BracketOpen) {
                expr = self.parse_subscript(expr)?;
            } else if self.eat(&Token::ParenOpen) {
                let (args, kwargs) = self.parse_call_args()?;
                expr = Expr::Call { func: Box::new(expr), args, kwargs };
            } else if self.eat(&Token::Pipe) {
                let name = self.expect_ident()?;
                let (args, kwargs) = if self.eat(&Token::ParenOpen) {
                    self.parse_call_args()?
                } else {
                    (Vec::new(), Vec::new())
                };
                expr = Expr::Filter { name, expr: Some(Box::new(expr)), args, kwargs };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_subscript(&mut self, expr: Expr) -> Result<Expr, Error> {
        let start = if matches!(self.peek(), Some(Token::Colon)) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        if self.eat(&Token::Colon) {
            let stop = if matches!(self.peek(), Some(Token::Colon) | Some(Token::BracketClose)) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            };
            let step = if self.eat(&Token::Colon) {
                if matches!(self.peek(), Some(Token::BracketClose)) {
                    None
                } else {
                    Some(Box::new(self.parse_expression()?))
                }
            } else {
                None
            };
            self.expect(&Token::BracketClose)?;
            return Ok(Expr::Slice { expr: Box::new(expr), start, stop, step });
        }
        self.expect(&Token::BracketClose)?;
        Ok(Expr::GetItem { expr: Box::new(expr), index: start.expect("index present") })
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), Error> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !matches!(self.peek(), Some(Token::ParenClose)) {
            if let Some(Token::Ident(name)) = self.peek().cloned() {
                if matches!(self.tokens.get(self.pos + 1), Some((Token::Assign, _))) {
                    self.bump();
                    self.bump();
                    let value = self.parse_expression()?;
                    kwargs.push((name, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                    continue;
                }
            }
            args.push(self.parse_expression()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::ParenClose)?;
        Ok((args, kwargs))
    }

    fn parse_filter_chain(&mut self, initial: Option<Expr>) -> Result<Expr, Error> {
        let name = self.expect_ident()?;
        let (args, kwargs) = if self.eat(&Token::ParenOpen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        let mut expr = Expr::Filter { name, expr: initial.map(Box::new), args, kwargs };
        while self.eat(&Token::Pipe) {
            let name = self.expect_ident()?;
            let (args, kwargs) = if self.eat(&Token::ParenOpen) {
                self.parse_call_args()?
            } else {
                (Vec::new(), Vec::new())
            };
            expr = Expr::Filter { name, expr: Some(Box::new(expr)), args, kwargs };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        match self.peek().cloned() {
            Some(Token::Int(i)) => {
                self.bump();
                Ok(Expr::Const(Value::Int(i)))
            }
            Some(Token::Float(f)) => {
                self.bump();
                Ok(Expr::Const(Value::Float(f)))
            }
            Some(Token::Str(s)) => {
                self.bump();
                let mut combined = s;
                while let Some(Token::Str(next)) = self.peek().cloned() {
                    self.bump();
                    combined.push_str(&next);
                }
                Ok(Expr::Const(Value::Str(combined.into())))
            }
            Some(Token::Ident(name)) => {
                self.bump();
                match name.as_str() {
                    "true" | "True" => Ok(Expr::Const(Value::Bool(true))),
                    "false" | "False" => Ok(Expr::Const(Value::Bool(false))),
                    "none" | "None" => Ok(Expr::Const(Value::None)),
                    "await" => Ok(Expr::Await(Box::new(self.parse_unary()?))),
                    _ => Ok(Expr::Var(name)),
                }
            }
            Some(Token::ParenOpen) => {
                self.bump();
                if self.eat(&Token::ParenClose) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expression()?;
                if self.eat(&Token::Comma) {
                    let mut items = vec![first];
                    while !matches!(self.peek(), Some(Token::ParenClose)) {
                        items.push(self.parse_expression()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::ParenClose)?;
                    return Ok(Expr::List(items));
                }
                self.expect(&Token::ParenClose)?;
                Ok(first)
            }
            Some(Token::BracketOpen) => {
                self.bump();
                let mut items = Vec::new();
                while !matches!(self.peek(), Some(Token::BracketClose)) {
                    items.push(self.parse_expression()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::BracketClose)?;
                Ok(Expr::List(items))
            }
            Some(Token::BraceOpen) => {
                self.bump();
                let mut items = Vec::new();
                while !matches!(self.peek(), Some(Token::BraceClose)) {
                    let key = self.parse_expression()?;
                    self.expect(&Token::Colon)?;
                    let value = self.parse_expression()?;
                    items.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::BraceClose)?;
                Ok(Expr::Map(items))
            }
            other => Err(self.err(format!("unexpected token {:?}, expected an expression", other))),
        }
    }
}

fn is_atom_start(t: &Token) -> bool {
    matches!(
        t,
        Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::ParenOpen | Token::BracketOpen | Token::BraceOpen
    )
}

fn is_keyword(i: &str) -> bool {
    matches!(i, "and" | "or" | "not" | "in" | "if" | "else" | "elif" | "endif")
}

fn assign_target_to_expr(target: AssignTarget) -> Expr {
    match target {
        AssignTarget::Name(n) => Expr::Var(n),
        AssignTarget::Attr { expr, name } => Expr::GetAttr { expr, name },
        AssignTarget::Item { expr, index } => Expr::GetItem { expr, index },
        AssignTarget::Tuple(items) => Expr::List(items.into_iter().map(assign_target_to_expr).collect()),
    }
}

fn body_references_caller(body: &Body) -> bool {
    body.iter().any(stmt_references_caller)
}

fn stmt_references_caller(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::EmitExpr(e) => expr_references_caller(e),
        Stmt::If(s) => {
            s.branches.iter().any(|(c, b)| expr_references_caller(c) || body_references_caller(b))
                || body_references_caller(&s.else_body)
        }
        Stmt::For(s) => {
            expr_references_caller(&s.iter)
                || body_references_caller(&s.body)
                || body_references_caller(&s.else_body)
        }
        Stmt::Set(s) => expr_references_caller(&s.expr),
        Stmt::SetBlock(s) => body_references_caller(&s.body),
        Stmt::Block(s) => body_references_caller(&s.body),
        Stmt::AutoEscape(s) => body_references_caller(&s.body),
        Stmt::FilterBlock(s) => body_references_caller(&s.body),
        Stmt::With(s) => body_references_caller(&s.body),
        Stmt::Do(e) => expr_references_caller(e),
        Stmt::CallBlock(s) => expr_references_caller(&s.call) || body_references_caller(&s.body),
        _ => false,
    }
}

fn expr_references_caller(expr: &Expr) -> bool {
    match expr {
        Expr::Var(name) => name == "caller",
        Expr::Call { func, args, kwargs } => {
            matches!(func.as_ref(), Expr::Var(n) if n == "caller")
                || expr_references_caller(func)
                || args.iter().any(expr_references_caller)
                || kwargs.iter().any(|(_, v)| expr_references_caller(v))
        }
        Expr::GetAttr { expr, .. } | Expr::UnaryOp { expr, .. } | Expr::Not(expr) | Expr::Await(expr) => {
            expr_references_caller(expr)
        }
        Expr::GetItem { expr, index } => expr_references_caller(expr) || expr_references_caller(index),
        Expr::BinOp { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            expr_references_caller(left) || expr_references_caller(right)
        }
        Expr::Compare { left, ops } => {
            expr_references_caller(left) || ops.iter().any(|(_, e)| expr_references_caller(e))
        }
        Expr::IfExpr { test, true_expr, false_expr } => {
            expr_references_caller(test)
                || expr_references_caller(true_expr)
                || false_expr.as_deref().is_some_and(expr_references_caller)
        }
        Expr::Filter { expr, args, kwargs, .. } => {
            expr.as_deref().is_some_and(expr_references_caller)
                || args.iter().any(expr_references_caller)
                || kwargs.iter().any(|(_, v)| expr_references_caller(v))
        }
        Expr::Test { expr, args, kwargs, .. } => {
            expr_references_caller(expr)
                || args.iter().any(expr_references_caller)
                || kwargs.iter().any(|(_, v)| expr_references_caller(v))
        }
        Expr::List(items) | Expr::Concat(items) => items.iter().any(expr_references_caller),
        Expr::Map(items) => items.iter().any(|(k, v)| expr_references_caller(k) || expr_references_caller(v)),
        Expr::Slice { expr, start, stop, step } => {
            expr_references_caller(expr)
                || start.as_deref().is_some_and(expr_references_caller)
                || stop.as_deref().is_some_and(expr_references_caller)
                || step.as_deref().is_some_and(expr_references_caller)
        }
        Expr::Const(_) => false,
    }
}

fn body_to_trans_parts(body: &Body, filename: &str) -> Result<Vec<TransPart>, Error> {
    let mut parts = Vec::new();
    for stmt in body {
        match stmt {
            Stmt::EmitRaw(s) => parts.push(TransPart::Text((**s).clone())),
            Stmt::EmitExpr(s) => match &**s {
                Expr::Var(name) => parts.push(TransPart::Var(name.clone())),
                _ => {
                    let mut e = Error::new(
                        ErrorKind::TemplateSyntaxError,
                        "only bare variable names may be interpolated inside {% trans %}",
                    );
                    e.set_location(filename, s.line as usize);
                    return Err(e);
                }
            },
            _ => {
                return Err(Error::new(
                    ErrorKind::TemplateSyntaxError,
                    "{% trans %} blocks may only contain text and variable interpolation",
                ))
            }
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text() {
        let ast = parse("hello", "t").unwrap();
        assert_eq!(ast.body.len(), 1);
    }

    #[test]
    fn parses_if_else() {
        let ast = parse("{% if x %}a{% else %}b{% endif %}", "t").unwrap();
        match &ast.body[0] {
            Stmt::If(s) => {
                assert_eq!(s.branches.len(), 1);
                assert_eq!(s.else_body.len(), 1);
            }
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn parses_for_loop_with_filter() {
        let ast = parse("{% for x in items if x.active %}{{ x.name }}{% endfor %}", "t").unwrap();
        match &ast.body[0] {
            Stmt::For(s) => assert!(s.filter_expr.is_some()),
            _ => panic!("expected for"),
        }
    }

    #[test]
    fn parses_macro_with_varargs_kwonly_kwargs() {
        let ast = parse("{% macro f(a, b=1, *args, c, **kwargs) %}{{ a }}{% endmacro %}", "t").unwrap();
        match &ast.body[0] {
            Stmt::Macro(m) => {
                assert_eq!(m.params, vec!["a".to_string(), "b".to_string()]);
                assert!(m.has_varargs);
                assert!(m.has_kwargs);
                assert_eq!(m.kwonly_params, vec!["c".to_string()]);
            }
            _ => panic!("expected macro"),
        }
    }

    #[test]
    fn parses_filter_and_is_test() {
        let ast = parse("{{ x|default(1) is odd }}", "t").unwrap();
        match &ast.body[0] {
            Stmt::EmitExpr(e) => match &**e {
                Expr::Test { name, .. } => assert_eq!(name, "odd"),
                other => panic!("expected test, got {:?}", other),
            },
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn parses_raw_block_literally() {
        let ast = parse("{% raw %}{{ not a var }}{% endraw %}", "t").unwrap();
        match &ast.body[0] {
            Stmt::EmitRaw(s) => assert_eq!(&**s, "{{ not a var }}"),
            _ => panic!("expected raw emit"),
        }
    }
}
