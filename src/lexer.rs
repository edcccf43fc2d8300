//! Tokenizer: turns template source into a token stream, switching between
//! "raw data" mode and "code" mode at `{{`, `{%`, `{#` delimiters.

use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    TemplateData(String),
    VariableStart(bool),
    VariableEnd(bool),
    BlockStart(bool),
    BlockEnd(bool),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Plus,
    Minus,
    Mul,
    Div,
    FloorDiv,
    Pow,
    Mod,
    Dot,
    Comma,
    Colon,
    Tilde,
    Assign,
    Pipe,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    BracketOpen,
    BracketClose,
    ParenOpen,
    ParenClose,
    BraceOpen,
    BraceClose,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::TemplateData(_) => write!(f, "template data"),
            Token::VariableStart(_) => write!(f, "`{{{{`"),
            Token::VariableEnd(_) => write!(f, "`}}}}`"),
            Token::BlockStart(_) => write!(f, "`{{%`"),
            Token::BlockEnd(_) => write!(f, "`%}}`"),
            Token::Ident(s) => write!(f, "identifier `{s}`"),
            Token::Str(_) => write!(f, "string"),
            Token::Int(_) => write!(f, "integer"),
            Token::Float(_) => write!(f, "float"),
            Token::Plus => write!(f, "`+`"),
            Token::Minus => write!(f, "`-`"),
            Token::Mul => write!(f, "`*`"),
            Token::Div => write!(f, "`/`"),
            Token::FloorDiv => write!(f, "`//`"),
            Token::Pow => write!(f, "`**`"),
            Token::Mod => write!(f, "`%`"),
            Token::Dot => write!(f, "`.`"),
            Token::Comma => write!(f, "`,`"),
            Token::Colon => write!(f, "`:`"),
            Token::Tilde => write!(f, "`~`"),
            Token::Assign => write!(f, "`=`"),
            Token::Pipe => write!(f, "`|`"),
            Token::Eq => write!(f, "`==`"),
            Token::Ne => write!(f, "`!=`"),
            Token::Gt => write!(f, "`>`"),
            Token::Gte => write!(f, "`>=`"),
            Token::Lt => write!(f, "`<`"),
            Token::Lte => write!(f, "`<=`"),
            Token::BracketOpen => write!(f, "`[`"),
            Token::BracketClose => write!(f, "`]`"),
            Token::ParenOpen => write!(f, "`(`"),
            Token::ParenClose => write!(f, "`)`"),
            Token::BraceOpen => write!(f, "`{{`"),
            Token::BraceClose => write!(f, "`}}`"),
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Span {
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Data,
    Code,
    Comment,
}

pub struct Lexer<'s> {
    source: &'s str,
    rest: &'s str,
    mode: Mode,
    line: u32,
    pending_trim_next: bool,
}

const VARIABLE_START: &str = "{{";
const VARIABLE_END: &str = "}}";
const BLOCK_START: &str = "{%";
const BLOCK_END: &str = "%}";
const COMMENT_START: &str = "{#";
const COMMENT_END: &str = "#}";

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Lexer<'s> {
        Lexer {
            source,
            rest: source,
            mode: Mode::Data,
            line: 1,
            pending_trim_next: false,
        }
    }

    fn advance(&mut self, n: usize) -> &'s str {
        let (taken, rest) = self.rest.split_at(n);
        self.line += taken.matches('\n').count() as u32;
        self.rest = rest;
        taken
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest.trim_start();
        let n = self.rest.len() - trimmed.len();
        self.advance(n);
    }

    fn find_delim_in_data(&self) -> Option<(usize, &'static str, bool)> {
        let candidates = [
            (VARIABLE_START, false),
            (BLOCK_START, false),
            (COMMENT_START, false),
        ];
        let mut best: Option<(usize, &'static str, bool)> = None;
        for (needle, _) in candidates {
            if let Some(idx) = self.rest.find(needle) {
                let trim = self.rest[idx..].as_bytes().get(needle.len()) == Some(&b'-');
                if best.map_or(true, |(bi, ..)| idx < bi) {
                    best = Some((idx, needle, trim));
                }
            }
        }
        best
    }

    fn next_data(&mut self) -> Result<Option<(Token, Span)>, Error> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let start_line = self.line;
        match self.find_delim_in_data() {
            Some((0, needle, trim)) => {
                let marker_len = needle.len() + if trim { 1 } else { 0 };
                self.advance(marker_len);
                self.mode = if needle == COMMENT_START {
                    Mode::Comment
                } else {
                    Mode::Code
                };
                let tok = match needle {
                    VARIABLE_START => Token::VariableStart(trim),
                    BLOCK_START => Token::BlockStart(trim),
                    _ => return self.next_token(),
                };
                Ok(Some((tok, Span { start_line, end_line: self.line })))
            }
            Some((idx, ..)) => {
                let data = self.advance(idx);
                Ok(Some((
                    Token::TemplateData(data.to_string()),
                    Span { start_line, end_line: self.line },
                )))
            }
            None => {
                let data = self.advance(self.rest.len());
                Ok(Some((
                    Token::TemplateData(data.to_string()),
                    Span { start_line, end_line: self.line },
                )))
            }
        }
    }

    fn next_comment(&mut self) -> Result<Option<(Token, Span)>, Error> {
        match self.rest.find(COMMENT_END) {
            Some(idx) => {
                let trim_before = self.rest.as_bytes().get(idx.wrapping_sub(1)) == Some(&b'-');
                let end = if trim_before { idx + COMMENT_END.len() } else { idx + COMMENT_END.len() };
                self.advance(end);
                self.mode = Mode::Data;
                self.next_token()
            }
            None => Err(Error::new(
                ErrorKind::TemplateSyntaxError,
                "unexpected end of input, expected end of comment tag",
            )),
        }
    }

    fn next_code(&mut self) -> Result<Option<(Token, Span)>, Error> {
        self.skip_whitespace();
        let start_line = self.line;
        if let Some(rest) = self.rest.strip_prefix("-%}").or_else(|| self.rest.strip_prefix("%}")) {
            let trim = self.rest.starts_with("-%}");
            self.advance(self.rest.len() - rest.len());
            self.mode = Mode::Data;
            return Ok(Some((Token::BlockEnd(trim), Span { start_line, end_line: self.line })));
        }
        if let Some(rest) = self.rest.strip_prefix("-}}").or_else(|| self.rest.strip_prefix("}}")) {
            let trim = self.rest.starts_with("-}}");
            self.advance(self.rest.len() - rest.len());
            self.mode = Mode::Data;
            return Ok(Some((Token::VariableEnd(trim), Span { start_line, end_line: self.line })));
        }
        if self.rest.is_empty() {
            return Err(Error::new(
                ErrorKind::TemplateSyntaxError,
                "unexpected end of input, expected end of block or variable tag",
            ));
        }
        let c = self.rest.chars().next().unwrap();
        macro_rules! single {
            ($tok:expr, $len:expr) => {{
                self.advance($len);
                Ok(Some(($tok, Span { start_line, end_line: self.line })))
            }};
        }
        match c {
            '+' => single!(Token::Plus, 1),
            '-' => single!(Token::Minus, 1),
            '~' => single!(Token::Tilde, 1),
            '.' => single!(Token::Dot, 1),
            ',' => single!(Token::Comma, 1),
            ':' => single!(Token::Colon, 1),
            '|' => single!(Token::Pipe, 1),
            '[' => single!(Token::BracketOpen, 1),
            ']' => single!(Token::BracketClose, 1),
            '(' => single!(Token::ParenOpen, 1),
            ')' => single!(Token::ParenClose, 1),
            '{' => single!(Token::BraceOpen, 1),
            '}' => single!(Token::BraceClose, 1),
            '*' if self.rest.starts_with("**") => single!(Token::Pow, 2),
            '*' => single!(Token::Mul, 1),
            '/' if self.rest.starts_with("//") => single!(Token::FloorDiv, 2),
            '/' => single!(Token::Div, 1),
            '%' => single!(Token::Mod, 1),
            '=' if self.rest.starts_with("==") => single!(Token::Eq, 2),
            '=' => single!(Token::Assign, 1),
            '!' if self.rest.starts_with("!=") => single!(Token::Ne, 2),
            '>' if self.rest.starts_with(">=") => single!(Token::Gte, 2),
            '>' => single!(Token::Gt, 1),
            '<' if self.rest.starts_with("<=") => single!(Token::Lte, 2),
            '<' => single!(Token::Lt, 1),
            '"' | '\'' => self.lex_string(c, start_line),
            c if c.is_ascii_digit() => self.lex_number(start_line),
            c if c == '_' || c.is_alphabetic() => self.lex_ident(start_line),
            other => Err(Error::new(
                ErrorKind::TemplateSyntaxError,
                format!("unexpected character {other:?}"),
            )),
        }
    }

    fn lex_string(&mut self, quote: char, start_line: u32) -> Result<Option<(Token, Span)>, Error> {
        self.advance(1);
        let mut value = String::new();
        loop {
            match self.rest.chars().next() {
                None => {
                    return Err(Error::new(
                        ErrorKind::TemplateSyntaxError,
                        "unexpected end of input, unterminated string",
                    ))
                }
                Some(c) if c == quote => {
                    self.advance(1);
                    break;
                }
                Some('\\') => {
                    self.advance(1);
                    let escaped = match self.rest.chars().next() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some(c) if c == quote => quote,
                        Some(c) => c,
                        None => break,
                    };
                    value.push(escaped);
                    self.advance(escaped.len_utf8());
                }
                Some(c) => {
                    value.push(c);
                    self.advance(c.len_utf8());
                }
            }
        }
        Ok(Some((Token::Str(value), Span { start_line, end_line: self.line })))
    }

    fn lex_number(&mut self, start_line: u32) -> Result<Option<(Token, Span)>, Error> {
        let len = self
            .rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(self.rest.len());
        let text = self.advance(len);
        let tok = if text.contains('.') {
            Token::Float(text.parse().map_err(|_| {
                Error::new(ErrorKind::TemplateSyntaxError, format!("invalid float literal `{text}`"))
            })?)
        } else {
            Token::Int(text.parse().map_err(|_| {
                Error::new(ErrorKind::TemplateSyntaxError, format!("invalid integer literal `{text}`"))
            })?)
        };
        Ok(Some((tok, Span { start_line, end_line: self.line })))
    }

    fn lex_ident(&mut self, start_line: u32) -> Result<Option<(Token, Span)>, Error> {
        let len = self
            .rest
            .find(|c: char| !(c == '_' || c.is_alphanumeric()))
            .unwrap_or(self.rest.len());
        let text = self.advance(len);
        Ok(Some((Token::Ident(text.to_string()), Span { start_line, end_line: self.line })))
    }

    fn next_token(&mut self) -> Result<Option<(Token, Span)>, Error> {
        match self.mode {
            Mode::Data => self.next_data(),
            Mode::Code => self.next_code(),
            Mode::Comment => self.next_comment(),
        }
    }

    /// Scans literal text up to a matching `{% endraw %}`, for `{% raw %}`
    /// blocks whose contents must never be tokenized as code.
    fn consume_raw(&mut self) -> Result<(Token, Span), Error> {
        let start_line = self.line;
        let mut search_from = 0;
        loop {
            match self.rest[search_from..].find("{%") {
                None => {
                    return Err(Error::new(
                        ErrorKind::TemplateSyntaxError,
                        "unexpected end of input, expected `{% endraw %}`",
                    ))
                }
                Some(rel) => {
                    let idx = search_from + rel;
                    let after = &self.rest[idx + 2..];
                    let after = after.strip_prefix('-').unwrap_or(after);
                    let after = after.trim_start();
                    if after.starts_with("endraw") {
                        let data = self.advance(idx);
                        return Ok((
                            Token::TemplateData(data.to_string()),
                            Span { start_line, end_line: self.line },
                        ));
                    }
                    search_from = idx + 2;
                }
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<(Token, Span)>, Error> {
        let mut tokens: Vec<(Token, Span)> = Vec::new();
        loop {
            if tokens.len() >= 3 {
                let n = tokens.len();
                let is_raw_open = matches!(tokens[n - 3].0, Token::BlockStart(_))
                    && matches!(&tokens[n - 2].0, Token::Ident(i) if i == "raw")
                    && matches!(tokens[n - 1].0, Token::BlockEnd(_));
                if is_raw_open && self.mode == Mode::Data {
                    tokens.push(self.consume_raw()?);
                    continue;
                }
            }
            match self.next_token()? {
                Some(pair) => tokens.push(pair),
                None => break,
            }
        }
        apply_whitespace_control(&mut tokens);
        Ok(tokens)
    }
}

/// Applies `{%-`/`-%}`/`{{-`/`-}}` whitespace trimming to adjacent
/// `TemplateData` tokens (§4.1 whitespace control).
fn apply_whitespace_control(tokens: &mut [(Token, Span)]) {
    for i in 0..tokens.len() {
        let trims_before = matches!(
            &tokens[i].0,
            Token::VariableStart(true) | Token::BlockStart(true)
        );
        if trims_before && i > 0 {
            if let Token::TemplateData(ref mut data) = tokens[i - 1].0 {
                *data = data.trim_end().to_string();
            }
        }
        let trims_after = matches!(&tokens[i].0, Token::VariableEnd(true) | Token::BlockEnd(true));
        if trims_after && i + 1 < tokens.len() {
            if let Token::TemplateData(ref mut data) = tokens[i + 1].0 {
                *data = data.trim_start().to_string();
            }
        }
    }
}

#[allow(dead_code)]
fn to_cow(s: String) -> Cow<'static, str> {
    Cow::Owned(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(kinds("hello world"), vec![Token::TemplateData("hello world".into())]);
    }

    #[test]
    fn variable_block() {
        assert_eq!(
            kinds("{{ a.b }}"),
            vec![
                Token::VariableStart(false),
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::VariableEnd(false),
            ]
        );
    }

    #[test]
    fn whitespace_trim() {
        assert_eq!(
            kinds("a {%- if x %}b"),
            vec![
                Token::TemplateData("a".into()),
                Token::BlockStart(true),
                Token::Ident("if".into()),
                Token::Ident("x".into()),
                Token::BlockEnd(false),
                Token::TemplateData("b".into()),
            ]
        );
    }

    #[test]
    fn floor_div_and_pow() {
        assert_eq!(kinds("{{ 2**3 // 2 }}")[1..5].to_vec(), vec![
            Token::Int(2),
            Token::Pow,
            Token::Int(3),
            Token::FloorDiv,
        ]);
    }
}
