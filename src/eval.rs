//! The tree-walking evaluator (§4.6 C6).
//!
//! `State` carries everything a render step needs and has no lifetime
//! parameters, so filters/tests/globals (`NativeFunc`) can be stored as
//! `Arc<dyn Fn(&mut State, ...)>` without infecting the environment with a
//! borrow. Every `eval_*`/`exec_*` function takes `&mut State` plus the AST
//! node and returns either a `Value` or `()`, propagating `Error` with `?`.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::ast::{
    AssignTarget, Block, Body, CallBlock, Expr, ForLoop, FromImport, IfCond, Import, Include,
    MacroDef, Set, SetBlock, Stmt, Trans, TransPart, With,
};
use crate::cache::CompiledTemplate;
use crate::context::{CallerRecord, Context, LoopFrame};
use crate::environment::EnvironmentInner;
use crate::error::{Error, ErrorKind};
use crate::import::{bind_from_import, Module};
use crate::inheritance::{resolve_chain, BlockLevel};
use crate::output::Output;
use crate::scope::Scope;
use crate::utils::write_escaped;
use crate::value::{
    add, concat, div, floordiv, modulo, mul, pow, sub, values_cmp, values_equal, Key, Kwargs,
    LoopRecordState, MacroValue, UndefinedKind, Value,
};

/// Per-render evaluator state. Owned, no lifetimes: this is what lets
/// `NativeFunc` be a plain `dyn Fn` instead of something generic over `'s`.
pub struct State {
    pub env: Arc<EnvironmentInner>,
    pub ctx: Context,
    pub out: Output,
}

/// How a block of statements exited, used to unwind `break`/`continue`
/// without leaving the enclosing `for` loop's Rust call frame (§4.6).
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Entry point: renders `compiled` (following its `extends` chain, if any)
/// into `state.out`.
pub fn render_template(state: &mut State, compiled: &Arc<CompiledTemplate>) -> Result<(), Error> {
    let has_extends = compiled.ast.body.iter().any(|s| matches!(s, Stmt::Extends(_)));
    if has_extends {
        let chain = resolve_chain(state, compiled.clone())?;
        render_root_with_blocks(state, &chain.root, &chain.blocks)
    } else {
        exec_body(state, &compiled.ast.body)?;
        Ok(())
    }
}

/// Renders a single named block from `compiled`'s `extends` chain (or its
/// own top-level blocks, if it doesn't extend anything) into `state.out`
/// (§6 `render-block`). `super()` works the same as during a full render.
pub fn render_named_block(state: &mut State, compiled: &Arc<CompiledTemplate>, name: &str) -> Result<(), Error> {
    let has_extends = compiled.ast.body.iter().any(|s| matches!(s, Stmt::Extends(_)));
    let (blocks, root_name) = if has_extends {
        let chain = resolve_chain(state, compiled.clone())?;
        (chain.blocks, chain.root.name.clone())
    } else {
        let mut blocks = std::collections::HashMap::new();
        for (block_name, level) in crate::inheritance::own_blocks(compiled) {
            blocks.insert(block_name, vec![level]);
        }
        (blocks, compiled.name.clone())
    };
    let levels = blocks.get(name).cloned().ok_or_else(|| {
        Error::new(ErrorKind::TemplateError, format!("block `{name}` is not defined in `{}`", compiled.name))
    })?;
    let prev_blocks = std::mem::replace(&mut state.ctx.block_table, blocks.clone());
    let prev_name = state.ctx.template_name.clone();
    state.ctx.template_name = root_name;
    let scoped = levels.first().map(|l| l.scoped).unwrap_or(false);
    render_block_level(state, &levels, 0, scoped, &[])?;
    state.ctx.template_name = prev_name;
    state.ctx.block_table = prev_blocks;
    Ok(())
}

fn render_root_with_blocks(
    state: &mut State,
    root: &Arc<CompiledTemplate>,
    blocks: &std::collections::HashMap<String, Vec<BlockLevel>>,
) -> Result<(), Error> {
    let prev = std::mem::replace(&mut state.ctx.block_table, blocks.clone());
    let prev_name = state.ctx.template_name.clone();
    state.ctx.template_name = root.name.clone();
    exec_body(state, &root.ast.body)?;
    state.ctx.template_name = prev_name;
    state.ctx.block_table = prev;
    Ok(())
}

fn tag_err(state: &State, mut err: Error, line: u32) -> Error {
    err.set_location(&state.ctx.template_name, line as usize);
    err
}

fn exec_body(state: &mut State, body: &[Stmt]) -> Result<Flow, Error> {
    for stmt in body {
        match exec_stmt(state, stmt)? {
            Flow::Normal => {}
            other => return Ok(other),
        }
    }
    Ok(Flow::Normal)
}

/// `max-string-length` (§8 "cumulative memory estimate... updated when
/// large values are materialized"): checked wherever string concatenation
/// can grow a value without bound.
fn check_produced_string(state: &State, value: &Value) -> Result<(), Error> {
    if let Some(sec) = &state.ctx.security {
        if let Value::Str(s) | Value::SafeStr(s) = value {
            sec.check_string_length(s.len())?;
        }
    }
    Ok(())
}

/// Writes `s` straight through, after metering it against the sandbox's
/// `max_output_bytes` budget (§4.8), so plain text counts toward the limit
/// the same as filtered/escaped expression output.
fn emit_raw(state: &mut State, s: &str) -> Result<(), Error> {
    let text = if let Some(sec) = &state.ctx.security {
        sec.sanitize_chunk(true, s.to_string())
    } else {
        s.to_string()
    };
    if let Some(sec) = &state.ctx.security {
        sec.tick_output(text.len())?;
    }
    state.out.write_str(&text).map_err(Error::from)
}

/// Escapes `value` per `mode` into a scratch buffer, meters its byte length
/// against the sandbox before committing it to `state.out` (§4.8), so a
/// breach raises before any of the over-budget chunk is emitted.
fn emit_escaped(state: &mut State, mode: crate::utils::AutoEscape, value: &Value) -> Result<(), Error> {
    let mut buf = String::new();
    write_escaped(&mut buf, mode, value).map_err(Error::from)?;
    let buf = if let Some(sec) = &state.ctx.security {
        sec.sanitize_chunk(value.is_safe(), buf)
    } else {
        buf
    };
    if let Some(sec) = &state.ctx.security {
        sec.tick_output(buf.len())?;
    }
    state.out.write_str(&buf).map_err(Error::from)
}

fn exec_stmt(state: &mut State, stmt: &Stmt) -> Result<Flow, Error> {
    if let Some(sec) = &state.ctx.security {
        sec.check_deadline()?;
    }
    match stmt {
        Stmt::EmitRaw(s) => {
            emit_raw(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::EmitExpr(e) => {
            let value = eval_expr(state, e).map_err(|err| tag_err(state, err, e.line))?;
            let value = apply_finalize_and_autoescape(state, value)?;
            emit_escaped(state, state.ctx.autoescape, &value)?;
            Ok(Flow::Normal)
        }
        Stmt::If(s) => exec_if(state, s),
        Stmt::For(s) => exec_for(state, s),
        Stmt::Set(s) => {
            exec_set(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::SetBlock(s) => {
            exec_set_block(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::Block(s) => exec_block(state, s),
        Stmt::AutoEscape(s) => exec_autoescape(state, s),
        Stmt::FilterBlock(s) => exec_filter_block(state, s),
        Stmt::With(s) => exec_with(state, s),
        Stmt::Do(e) => {
            eval_expr(state, e).map_err(|err| tag_err(state, err, e.line))?;
            Ok(Flow::Normal)
        }
        Stmt::Extends(_) => Ok(Flow::Normal),
        Stmt::Include(s) => {
            exec_include(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::Import(s) => {
            exec_import(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::FromImport(s) => {
            exec_from_import(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::Macro(s) => {
            define_macro(state, s);
            Ok(Flow::Normal)
        }
        Stmt::CallBlock(s) => {
            exec_call_block(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::Trans(s) => {
            exec_trans(state, s)?;
            Ok(Flow::Normal)
        }
        Stmt::Export(names) => {
            for name in names.iter() {
                if let Some(v) = state.ctx.scope.lookup(name) {
                    state.ctx.scope.set_export(name, v);
                }
            }
            Ok(Flow::Normal)
        }
        Stmt::Break(_) => Ok(Flow::Break),
        Stmt::Continue(_) => Ok(Flow::Continue),
    }
}

/// Runs the configured `finalize` callback (§4.1 `set-finalize`, §4.6
/// "Finalize hook") on an emitted value before autoescape is applied.
fn apply_finalize_and_autoescape(state: &mut State, value: Value) -> Result<Value, Error> {
    Ok(state.env.finalize(&value).unwrap_or(value))
}

// ---------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------

pub fn eval_expr(state: &mut State, expr: &Expr) -> Result<Value, Error> {
    match expr {
        Expr::Const(v) => {
            if let (Some(sec), Value::Str(s)) = (&state.ctx.security, v) {
                sec.check_input_length(s)?;
            }
            Ok(v.clone())
        }
        Expr::Var(name) => lookup_name(state, name).map(auto_await),
        Expr::GetAttr { expr, name } => {
            let base = eval_expr(state, expr)?;
            get_attr(state, &base, name).map(auto_await)
        }
        Expr::GetItem { expr, index } => {
            let base = eval_expr(state, expr)?;
            let idx = eval_expr(state, index)?;
            base.get_item(&idx).map(auto_await)
        }
        Expr::Slice { expr, start, stop, step } => {
            let base = eval_expr(state, expr)?;
            eval_slice(state, &base, start.as_deref(), stop.as_deref(), step.as_deref())
        }
        Expr::UnaryOp { op, expr } => {
            let v = eval_expr(state, expr)?;
            eval_unary(*op, v)
        }
        Expr::BinOp { op, left, right } => {
            let l = eval_expr(state, left)?;
            let r = eval_expr(state, right)?;
            let result = eval_binop(*op, l, r)?;
            check_produced_string(state, &result)?;
            Ok(result)
        }
        Expr::Compare { left, ops } => eval_compare(state, left, ops),
        Expr::And(a, b) => {
            let l = eval_expr(state, a)?;
            if !l.is_true() {
                Ok(l)
            } else {
                eval_expr(state, b)
            }
        }
        Expr::Or(a, b) => {
            let l = eval_expr(state, a)?;
            if l.is_true() {
                Ok(l)
            } else {
                eval_expr(state, b)
            }
        }
        Expr::Not(e) => Ok(Value::Bool(!eval_expr(state, e)?.is_true())),
        Expr::IfExpr { test, true_expr, false_expr } => {
            if eval_expr(state, test)?.is_true() {
                eval_expr(state, true_expr)
            } else {
                match false_expr {
                    Some(e) => eval_expr(state, e),
                    None => Ok(Value::undefined("if_expr", UndefinedKind::Chainable)),
                }
            }
        }
        Expr::Filter { name, expr, args, kwargs } => eval_filter(state, name, expr.as_deref(), args, kwargs),
        Expr::Test { name, expr, args, kwargs, negated } => {
            let result = eval_test(state, name, expr, args, kwargs)?;
            Ok(Value::Bool(result.is_true() != *negated))
        }
        Expr::Call { func, args, kwargs } => eval_call(state, func, args, kwargs),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for i in items {
                out.push(eval_expr(state, i)?);
            }
            Ok(Value::Seq(Arc::new(out)))
        }
        Expr::Map(pairs) => {
            let mut map = crate::value::ValueMap::new();
            for (k, v) in pairs {
                let key = Key::from_value(&eval_expr(state, k)?).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "invalid mapping key type")
                })?;
                map.insert(key, eval_expr(state, v)?);
            }
            Ok(Value::Map(Arc::new(map)))
        }
        Expr::Concat(parts) => {
            let mut acc = Value::Str("".into());
            let mut first = true;
            for p in parts {
                let v = eval_expr(state, p)?;
                acc = if first { v } else { concat(&acc, &v)? };
                first = false;
                check_produced_string(state, &acc)?;
            }
            Ok(acc)
        }
        Expr::Await(inner) => {
            let v = eval_expr(state, inner)?;
            match v {
                Value::Awaitable(boxed) => Ok((*boxed).clone()),
                other => Err(Error::new(ErrorKind::TemplateError, format!("{} is not awaitable", other.type_name()))),
            }
        }
    }
}

/// Transparently unwraps an awaitable when async is enabled (§4.6 implicit
/// auto-await on name/attribute/index lookups).
fn auto_await(v: Value) -> Value {
    match v {
        Value::Awaitable(inner) => (*inner).clone(),
        other => other,
    }
}

fn lookup_name(state: &mut State, name: &str) -> Result<Value, Error> {
    if name == "loop" {
        return Ok(match state.ctx.current_loop() {
            Some(frame) => Value::Loop(frame.state.clone()),
            None => Value::undefined("loop", UndefinedKind::Strict),
        });
    }
    match state.ctx.scope.lookup(name) {
        Some(v) => Ok(v),
        None => match state.env.get_global(name) {
            Some(v) => {
                if let Some(sec) = &state.ctx.security {
                    sec.check_global(name)?;
                }
                Ok(v)
            }
            None => Ok(state.env.make_undefined(name)),
        },
    }
}

/// Attribute resolution order (§4.6): loop record fields; namespace/module
/// entries; known string/mapping methods as nullary-ish bound callables;
/// otherwise a chainable-undefined labeled with the attribute name.
fn get_attr(state: &mut State, base: &Value, name: &str) -> Result<Value, Error> {
    if let Some(sec) = &state.ctx.security {
        sec.check_attribute(base.type_name(), name)?;
    }
    if let Value::Undefined(u) = base {
        return match u.kind {
            UndefinedKind::Strict => Err(Error::new(ErrorKind::UndefinedError, format!("`{:?}` is undefined", u.name))),
            _ => Ok(Value::undefined(name.to_string(), u.kind)),
        };
    }
    if let Value::Loop(loop_state) = base {
        if matches!(name, "previtem" | "nextitem") {
            if let Some(frame) = state.ctx.loop_stack.iter().rev().find(|f| Arc::ptr_eq(&f.state, loop_state)) {
                return Ok(if name == "previtem" { frame.previtem() } else { frame.nextitem() });
            }
        }
    }
    if let Some(v) = base.get_attr(name) {
        return Ok(v);
    }
    if matches!(base, Value::Str(_) | Value::SafeStr(_) | Value::Map(_) | Value::Loop(_) | Value::Namespace(_)) {
        if matches!(name, "upper" | "lower" | "title" | "capitalize" | "items" | "keys" | "values" | "get" | "split" | "startswith" | "endswith" | "strip" | "cycle" | "changed") {
            let bound = base.clone();
            let method = name.to_string();
            return Ok(Value::Callable(
                Arc::new(move |state: &mut State, args: &[Value], _kw: &Kwargs| {
                    if let Some(sec) = &state.ctx.security {
                        sec.check_method(&method)?;
                    }
                    bound.call_method(&method, args)
                }),
                format!("<bound method {name}>").into(),
            ));
        }
    }
    Ok(Value::undefined(name.to_string(), UndefinedKind::Chainable))
}

fn eval_slice(state: &mut State, base: &Value, start: Option<&Expr>, stop: Option<&Expr>, step: Option<&Expr>) -> Result<Value, Error> {
    let items = base.try_iter()?;
    let len = items.len() as i64;
    let step_v = match step {
        Some(e) => eval_expr(state, e)?.as_i64().unwrap_or(1),
        None => 1,
    };
    if step_v == 0 {
        return Err(Error::new(ErrorKind::InvalidOperation, "slice step cannot be zero"));
    }
    let clamp = |v: i64| -> i64 { v.max(0).min(len) };
    let norm = |v: i64| -> i64 { if v < 0 { (len + v).max(0) } else { v } };
    let (default_start, default_stop) = if step_v > 0 { (0, len) } else { (len - 1, -1) };
    let start_v = match start {
        Some(e) => {
            let raw = eval_expr(state, e)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "slice bound must be an integer"))?;
            clamp(norm(raw))
        }
        None => default_start,
    };
    let stop_v = match stop {
        Some(e) => {
            let raw = eval_expr(state, e)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "slice bound must be an integer"))?;
            if step_v > 0 { clamp(norm(raw)) } else if raw < 0 && norm(raw) == 0 { -1 } else { clamp(norm(raw)) }
        }
        None => default_stop,
    };
    let mut out = Vec::new();
    if step_v > 0 {
        let mut i = start_v;
        while i < stop_v && i < len {
            if i >= 0 {
                out.push(items[i as usize].clone());
            }
            i += step_v;
        }
    } else {
        let mut i = start_v;
        while i > stop_v && i >= 0 {
            if i < len {
                out.push(items[i as usize].clone());
            }
            i += step_v;
        }
    }
    Ok(Value::Seq(Arc::new(out)))
}

fn eval_unary(op: crate::ast::UnaryOpKind, v: Value) -> Result<Value, Error> {
    use crate::ast::UnaryOpKind::*;
    match op {
        Not => Ok(Value::Bool(!v.is_true())),
        Neg => match v {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Int(-(b as i64))),
            other => Err(Error::new(ErrorKind::InvalidOperation, format!("cannot negate {}", other.type_name()))),
        },
    }
}

fn eval_binop(op: crate::ast::BinOpKind, l: Value, r: Value) -> Result<Value, Error> {
    use crate::ast::BinOpKind::*;
    match op {
        Add => add(&l, &r),
        Sub => sub(&l, &r),
        Mul => mul(&l, &r),
        Div => div(&l, &r),
        FloorDiv => floordiv(&l, &r),
        Mod => modulo(&l, &r),
        Pow => pow(&l, &r),
        Concat => concat(&l, &r),
    }
}

fn eval_compare(state: &mut State, left: &Expr, ops: &[(crate::ast::CompareOp, Expr)]) -> Result<Value, Error> {
    use crate::ast::CompareOp::*;
    let mut lhs = eval_expr(state, left)?;
    for (op, rhs_expr) in ops {
        let rhs = eval_expr(state, rhs_expr)?;
        let ok = match op {
            Eq => values_equal(&lhs, &rhs),
            Ne => !values_equal(&lhs, &rhs),
            Lt => values_cmp(&lhs, &rhs).map(|o| o.is_lt()).unwrap_or(false),
            Le => values_cmp(&lhs, &rhs).map(|o| o.is_le()).unwrap_or(false),
            Gt => values_cmp(&lhs, &rhs).map(|o| o.is_gt()).unwrap_or(false),
            Ge => values_cmp(&lhs, &rhs).map(|o| o.is_ge()).unwrap_or(false),
            In => rhs.contains(&lhs)?,
            NotIn => !rhs.contains(&lhs)?,
        };
        if !ok {
            return Ok(Value::Bool(false));
        }
        lhs = rhs;
    }
    Ok(Value::Bool(true))
}

fn eval_args_kwargs(state: &mut State, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<(Vec<Value>, Kwargs), Error> {
    let mut out_args = Vec::with_capacity(args.len());
    for a in args {
        out_args.push(eval_expr(state, a)?);
    }
    let mut out_kwargs = Kwargs::new();
    for (k, v) in kwargs {
        out_kwargs.insert(k.clone(), eval_expr(state, v)?);
    }
    Ok((out_args, out_kwargs))
}

fn eval_filter(state: &mut State, name: &str, expr: Option<&Expr>, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, Error> {
    if let Some(sec) = &state.ctx.security {
        sec.check_filter(name)?;
    }
    let piped = match expr {
        Some(e) => eval_expr(state, e)?,
        None => Value::None,
    };
    let f = state.env.get_filter(name).ok_or_else(|| {
        Error::new(ErrorKind::UnknownFilter, format!("unknown filter `{name}`"))
    })?;
    let (mut call_args, kw) = eval_args_kwargs(state, args, kwargs)?;
    call_args.insert(0, piped);
    let result = f(state, &call_args, &kw)?;
    match result {
        Value::Awaitable(inner) => Ok((*inner).clone()),
        other => Ok(other),
    }
}

fn eval_test(state: &mut State, name: &str, expr: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, Error> {
    if let Some(sec) = &state.ctx.security {
        sec.check_test(name)?;
    }
    let subject = eval_expr(state, expr)?;
    let t = state.env.get_test(name).ok_or_else(|| {
        Error::new(ErrorKind::UnknownTest, format!("unknown test `{name}`"))
    })?;
    let (mut call_args, kw) = eval_args_kwargs(state, args, kwargs)?;
    call_args.insert(0, subject);
    t(state, &call_args, &kw)
}

fn eval_call(state: &mut State, func: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, Error> {
    // `caller()` is special-cased: it's not a real value binding.
    if let Expr::Var(name) = func {
        if name == "caller" {
            return call_caller(state, args, kwargs);
        }
        if name == "super" {
            return call_super(state);
        }
        if name == "loop" && !args.is_empty() && state.ctx.recursive_loop_stack.last().is_some() {
            let (target, body, depth0) = state.ctx.recursive_loop_stack.last().cloned().unwrap();
            let iterable = eval_expr(state, &args[0])?;
            state.out.begin_capture();
            let result = run_for_body(state, &target, &iterable, &body, None, true, depth0 + 1);
            let captured = state.out.end_capture();
            result?;
            return Ok(Value::from_safe_string(captured));
        }
    }
    let callee = eval_expr(state, func)?;
    let (call_args, call_kwargs) = eval_args_kwargs(state, args, kwargs)?;
    call_value(state, &callee, &call_args, &call_kwargs, None)
}

fn call_value(state: &mut State, callee: &Value, args: &[Value], kwargs: &Kwargs, caller: Option<Arc<CallerRecord>>) -> Result<Value, Error> {
    match callee {
        Value::Callable(f, name) => {
            if let Some(sec) = &state.ctx.security {
                sec.check_function(name)?;
            }
            f(state, args, kwargs)
        }
        Value::Macro(m) => call_macro(state, m.clone(), args, kwargs, caller),
        Value::Undefined(u) => Err(Error::new(
            ErrorKind::UndefinedError,
            format!("`{:?}` is undefined and cannot be called", u.name),
        )),
        other => Err(Error::new(ErrorKind::InvalidOperation, format!("{} is not callable", other.type_name()))),
    }
}

/// `{{ super() }}` (§4.6): renders the next-less-derived override for the
/// block currently on top of the cursor stack, or errors if there is none.
fn call_super(state: &mut State) -> Result<Value, Error> {
    let (levels, index) = state.ctx.block_cursor.last().cloned().ok_or_else(|| {
        Error::new(ErrorKind::TemplateError, "`super()` used outside of a block")
    })?;
    let next = index + 1;
    if next >= levels.len() {
        return Err(Error::new(ErrorKind::TemplateError, "there is no parent block to call `super()` on"));
    }
    state.out.begin_capture();
    state.ctx.block_cursor.push((levels.clone(), next));
    let result = exec_body(state, &levels[next].body);
    state.ctx.block_cursor.pop();
    let captured = state.out.end_capture();
    result?;
    Ok(Value::from_safe_string(captured))
}

fn call_caller(state: &mut State, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, Error> {
    let record = state.ctx.caller_stack.last().cloned().ok_or_else(|| {
        Error::new(ErrorKind::MacroError, "`caller()` used outside of a call block")
    })?;
    let (call_args, call_kwargs) = eval_args_kwargs(state, args, kwargs)?;
    let scope = Scope::child(&record.scope);
    bind_params(&scope, &record.params, &record.defaults, &[], &[], false, false, &call_args, &call_kwargs, "caller")?;
    let prev_scope = state.ctx.with_scope(scope);
    state.out.begin_capture();
    let body_result = exec_body(state, &record.body);
    let captured = state.out.end_capture();
    state.ctx.scope = prev_scope;
    body_result?;
    Ok(Value::from_safe_string(captured))
}

fn call_macro(state: &mut State, m: Arc<MacroValue>, args: &[Value], kwargs: &Kwargs, caller: Option<Arc<CallerRecord>>) -> Result<Value, Error> {
    if let Some(sec) = &state.ctx.security {
        sec.enter_recursion()?;
    }
    let scope = Scope::child(&m.closure);
    bind_params(
        &scope,
        &m.params,
        &m.defaults,
        &m.kwonly_params,
        &m.kwonly_defaults,
        m.has_varargs,
        m.has_kwargs,
        args,
        kwargs,
        &m.name,
    )?;
    let prev_scope = state.ctx.with_scope(scope);
    state.ctx.macro_stack.push(m.clone());
    let pushed_caller = caller.is_some();
    if let Some(c) = caller {
        state.ctx.caller_stack.push(c);
    }
    state.out.begin_capture();
    let result = exec_body(state, &m.body);
    let captured = state.out.end_capture();
    state.ctx.macro_stack.pop();
    if pushed_caller {
        state.ctx.caller_stack.pop();
    }
    state.ctx.scope = prev_scope;
    if let Some(sec) = &state.ctx.security {
        sec.exit_recursion();
    }
    result?;
    Ok(Value::from_safe_string(captured))
}

#[allow(clippy::too_many_arguments)]
fn bind_params(
    scope: &Arc<Scope>,
    params: &[String],
    defaults: &[Option<Value>],
    kwonly_params: &[String],
    kwonly_defaults: &[Option<Value>],
    has_varargs: bool,
    has_kwargs: bool,
    args: &[Value],
    kwargs: &Kwargs,
    macro_name: &str,
) -> Result<(), Error> {
    let mut remaining_kwargs = kwargs.clone();
    let positional_count = params.len();
    if args.len() > positional_count && !has_varargs {
        return Err(Error::new(ErrorKind::MacroError, format!("`{macro_name}` got too many positional arguments")));
    }
    for (i, name) in params.iter().enumerate() {
        let value = if i < args.len() {
            args[i].clone()
        } else if let Some(v) = remaining_kwargs.remove(name) {
            v
        } else if let Some(Some(default)) = defaults.get(i) {
            default.clone()
        } else {
            return Err(Error::new(ErrorKind::MacroError, format!("`{macro_name}` missing required argument `{name}`")));
        };
        scope.set(name, value);
    }
    if has_varargs {
        let extra: Vec<Value> = if args.len() > positional_count {
            args[positional_count..].to_vec()
        } else {
            Vec::new()
        };
        scope.set("varargs", Value::Seq(Arc::new(extra)));
    }
    for (i, name) in kwonly_params.iter().enumerate() {
        let value = if let Some(v) = remaining_kwargs.remove(name) {
            v
        } else if let Some(Some(default)) = kwonly_defaults.get(i) {
            default.clone()
        } else {
            return Err(Error::new(ErrorKind::MacroError, format!("`{macro_name}` missing required keyword argument `{name}`")));
        };
        scope.set(name, value);
    }
    if has_kwargs {
        let mut map = crate::value::ValueMap::new();
        for (k, v) in remaining_kwargs {
            map.insert(Key::Str(k.into()), v);
        }
        scope.set("kwargs", Value::Map(Arc::new(map)));
    } else if !remaining_kwargs.is_empty() {
        let unexpected: Vec<&str> = remaining_kwargs.keys().map(String::as_str).collect();
        return Err(Error::new(
            ErrorKind::MacroError,
            format!("`{macro_name}` got unexpected keyword arguments: {}", unexpected.join(", ")),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------

fn exec_if(state: &mut State, s: &IfCond) -> Result<Flow, Error> {
    for (cond, body) in &s.branches {
        if eval_expr(state, cond)?.is_true() {
            return exec_body(state, body);
        }
    }
    exec_body(state, &s.else_body)
}

fn exec_for(state: &mut State, s: &ForLoop) -> Result<Flow, Error> {
    let iterable = eval_expr(state, &s.iter)?;
    let body = Arc::new(s.body.clone());
    let depth0 = state.ctx.loop_stack.len();
    let executed = run_for_body(state, &s.target, &iterable, &body, s.filter_expr.as_ref(), s.recursive, depth0)?;
    if !executed {
        exec_body(state, &s.else_body)?;
    }
    Ok(Flow::Normal)
}

/// Runs one `for` body over `iterable`, returns whether any iteration ran.
/// Shared by plain `for` loops and `loop(children)` recursive re-entry
/// (§4.6), which supplies a fresh iterable against the same target/body.
fn run_for_body(
    state: &mut State,
    target: &AssignTarget,
    iterable: &Value,
    body: &Arc<Body>,
    filter_expr: Option<&Expr>,
    recursive: bool,
    depth0: usize,
) -> Result<bool, Error> {
    let mut items = iterable.try_iter()?;
    if let Some(filter_expr) = filter_expr {
        let mut filtered = Vec::with_capacity(items.len());
        for item in items {
            state.ctx.push_scope();
            bind_target(state, target, item.clone())?;
            let keep = eval_expr(state, filter_expr)?.is_true();
            state.ctx.pop_scope();
            if keep {
                filtered.push(item);
            }
        }
        items = filtered;
    }
    let items = Arc::new(items);
    let len = items.len();
    let mut executed = false;
    state.ctx.push_scope();
    if recursive {
        state.ctx.recursive_loop_stack.push((target.clone(), body.clone(), depth0));
    }
    for idx in 0..len {
        if let Some(sec) = &state.ctx.security {
            sec.tick_iteration()?;
            sec.check_deadline()?;
        }
        let record = Arc::new(LoopRecordState {
            index0: idx,
            len,
            depth0,
            last_changed: std::sync::Mutex::new(None),
        });
        state.ctx.loop_stack.push(LoopFrame { state: record, items: items.clone() });
        bind_target(state, target, items[idx].clone())?;
        executed = true;
        let flow = exec_body(state, body)?;
        state.ctx.loop_stack.pop();
        if matches!(flow, Flow::Break) {
            break;
        }
    }
    if recursive {
        state.ctx.recursive_loop_stack.pop();
    }
    state.ctx.pop_scope();
    Ok(executed)
}

fn bind_target(state: &mut State, target: &AssignTarget, value: Value) -> Result<(), Error> {
    match target {
        AssignTarget::Name(name) => {
            state.ctx.scope.set(name, value);
            Ok(())
        }
        AssignTarget::Tuple(targets) => {
            let items = value.try_iter()?;
            if items.len() != targets.len() {
                return Err(Error::new(ErrorKind::TemplateError, "tuple unpacking length mismatch"));
            }
            for (t, v) in targets.iter().zip(items) {
                bind_target(state, t, v)?;
            }
            Ok(())
        }
        AssignTarget::Attr { .. } | AssignTarget::Item { .. } => {
            assign_path(state, target, value)
        }
    }
}

fn exec_set(state: &mut State, s: &Set) -> Result<(), Error> {
    let value = eval_expr(state, &s.expr)?;
    bind_target(state, &s.target, value)
}

fn exec_set_block(state: &mut State, s: &SetBlock) -> Result<(), Error> {
    state.out.begin_capture();
    let result = exec_body(state, &s.body);
    let captured = state.out.end_capture();
    result?;
    let mut value = Value::Str(captured.into());
    check_produced_string(state, &value)?;
    if let Some(filter_expr) = &s.filter {
        if let Expr::Filter { name, args, kwargs, .. } = filter_expr {
            value = apply_named_filter(state, name, value, args, kwargs)?;
        }
    }
    bind_target(state, &s.target, value)
}

fn apply_named_filter(state: &mut State, name: &str, piped: Value, args: &[Expr], kwargs: &[(String, Expr)]) -> Result<Value, Error> {
    let f = state.env.get_filter(name).ok_or_else(|| {
        Error::new(ErrorKind::UnknownFilter, format!("unknown filter `{name}`"))
    })?;
    let (mut call_args, kw) = eval_args_kwargs(state, args, kwargs)?;
    call_args.insert(0, piped);
    f(state, &call_args, &kw)
}

/// `set target.path = expr` / `set target[idx] = expr` (§4.6 shape 2/3):
/// walks intermediate attributes without creating containers, mutating
/// only namespace leaves (the one genuinely mutable value kind).
fn assign_path(state: &mut State, target: &AssignTarget, value: Value) -> Result<(), Error> {
    match target {
        AssignTarget::Attr { expr, name } => {
            let base = eval_expr(state, expr)?;
            match base {
                Value::Namespace(ns) => {
                    ns.lock().unwrap().insert(name.clone(), value);
                    Ok(())
                }
                other => Err(Error::new(
                    ErrorKind::TemplateError,
                    format!("cannot assign attribute `{name}` on {}", other.type_name()),
                )),
            }
        }
        AssignTarget::Item { expr, index } => {
            let base = eval_expr(state, expr)?;
            let idx = eval_expr(state, index)?;
            match base {
                Value::Namespace(ns) => {
                    let key = idx.as_str().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "namespace keys must be strings"))?;
                    ns.lock().unwrap().insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(Error::new(
                    ErrorKind::TemplateError,
                    format!("cannot assign index on {}", other.type_name()),
                )),
            }
        }
        _ => unreachable!("assign_path only called for Attr/Item targets"),
    }
}

fn exec_block(state: &mut State, b: &Block) -> Result<Flow, Error> {
    match state.ctx.block_table.get(&b.name).cloned() {
        Some(levels) if !levels.is_empty() => render_block_level(state, &levels, 0, b.scoped, &b.body),
        _ => {
            if b.scoped {
                state.ctx.push_scope();
                let flow = exec_body(state, &b.body);
                state.ctx.pop_scope();
                flow
            } else {
                exec_body(state, &b.body)
            }
        }
    }
}

/// Renders one level of an overridden block; `{{ super() }}` inside its body
/// steps to `levels[index + 1]`, handled via the block cursor stack.
fn render_block_level(state: &mut State, levels: &[BlockLevel], index: usize, scoped: bool, fallback_body: &[Stmt]) -> Result<Flow, Error> {
    let level = match levels.get(index) {
        Some(l) => l,
        None => return exec_body(state, fallback_body),
    };
    state.ctx.block_cursor.push((levels.to_vec(), index));
    if scoped {
        state.ctx.push_scope();
    }
    let flow = exec_body(state, &level.body);
    if scoped {
        state.ctx.pop_scope();
    }
    state.ctx.block_cursor.pop();
    flow
}

fn exec_autoescape(state: &mut State, s: &crate::ast::AutoEscape) -> Result<Flow, Error> {
    let enabled = eval_expr(state, &s.enabled)?.is_true();
    let prev = state.ctx.autoescape;
    state.ctx.autoescape = if enabled { crate::utils::AutoEscape::Html } else { crate::utils::AutoEscape::None };
    let flow = exec_body(state, &s.body);
    state.ctx.autoescape = prev;
    flow
}

fn exec_filter_block(state: &mut State, s: &crate::ast::FilterBlock) -> Result<Flow, Error> {
    state.out.begin_capture();
    let flow = exec_body(state, &s.body);
    let captured = state.out.end_capture();
    let flow = flow?;
    let mut value = Value::Str(captured.into());
    check_produced_string(state, &value)?;
    for (name, args, kwargs) in &s.filters {
        value = apply_named_filter(state, name, value, args, kwargs)?;
    }
    emit_escaped(state, state.ctx.autoescape, &value)?;
    Ok(flow)
}

fn exec_with(state: &mut State, s: &With) -> Result<Flow, Error> {
    let mut bound = Vec::with_capacity(s.assignments.len());
    for (target, expr) in &s.assignments {
        bound.push((target, eval_expr(state, expr)?));
    }
    state.ctx.push_scope();
    for (target, value) in bound {
        bind_target(state, target, value)?;
    }
    let flow = exec_body(state, &s.body);
    state.ctx.pop_scope();
    flow
}

fn exec_include(state: &mut State, s: &Include) -> Result<(), Error> {
    let mut attempted = Vec::new();
    let mut loaded = None;
    for name_expr in &s.names {
        let name_val = eval_expr(state, name_expr)?;
        let name = name_val.as_str().ok_or_else(|| {
            Error::new(ErrorKind::TemplateError, "`include` target must evaluate to a string")
        })?.to_string();
        attempted.push(name.clone());
        if let Some(sec) = &state.ctx.security {
            sec.check_template_name(&name)?;
        }
        match state.env.load_compiled(&name) {
            Ok(compiled) => {
                loaded = Some(compiled);
                break;
            }
            Err(_) => continue,
        }
    }
    let compiled = match loaded {
        Some(c) => c,
        None if s.ignore_missing => return Ok(()),
        None => return Err(Error::not_found_many(attempted)),
    };
    let scope = if s.with_context {
        state.ctx.scope.clone()
    } else {
        Scope::root()
    };
    let prev = state.ctx.with_scope(scope);
    let prev_name = state.ctx.template_name.clone();
    state.ctx.template_name = compiled.name.clone();
    let result = render_template(state, &compiled);
    state.ctx.template_name = prev_name;
    state.ctx.scope = prev;
    result
}

/// Renders `template` in isolation and collects its top-level bindings and
/// macro definitions into a [`Module`] (§4.7). With `with_context`, the
/// module body executes in a child of the importer's current scope instead
/// of a fresh root, so it can see the caller's locals (§4.6/§4.7); such a
/// result is importer-specific and bypasses the name-keyed cache rather
/// than risk handing a context-dependent render to an unrelated importer.
fn render_module(state: &mut State, name: &str, with_context: bool) -> Result<Arc<Module>, Error> {
    if !with_context {
        if let Some(cached) = state.ctx.imports.cached(name) {
            return Ok(cached);
        }
    }
    state.ctx.imports.enter(name)?;
    if let Some(sec) = &state.ctx.security {
        sec.check_template_name(name)?;
    }
    let compiled = state.env.load_compiled(name)?;
    let module_scope = if with_context { Scope::child(&state.ctx.scope) } else { Scope::root() };
    let result = module_from_compiled(state, &compiled, module_scope);
    state.ctx.imports.exit(name);
    let module = result?;
    if !with_context {
        state.ctx.imports.store(name, module.clone());
    }
    Ok(module)
}

/// `make-module(vars)` / `make-module-with-context` (§6, §4.7): runs
/// `compiled` in module mode under whatever scope the caller already set up
/// on `state.ctx.scope` (a fresh root for `make_module`, a child of the
/// calling scope for `make_module_with_context`), bypassing the
/// name-keyed import cache since the caller already holds the `Template`.
pub fn make_module(state: &mut State, compiled: &Arc<CompiledTemplate>) -> Result<Arc<Module>, Error> {
    let scope = state.ctx.scope.clone();
    module_from_compiled(state, compiled, scope)
}

fn module_from_compiled(state: &mut State, compiled: &Arc<CompiledTemplate>, module_scope: Arc<Scope>) -> Result<Arc<Module>, Error> {
    let prev_scope = state.ctx.with_scope(module_scope.clone());
    let prev_name = state.ctx.template_name.clone();
    state.ctx.template_name = compiled.name.clone();
    let result = render_template(state, compiled);
    state.ctx.template_name = prev_name;
    state.ctx.scope = prev_scope;
    result?;
    let mut bindings = std::collections::HashMap::new();
    for stmt in &compiled.ast.body {
        if let Stmt::Macro(def) = stmt {
            if let Some(v) = module_scope.get_local(&def.name) {
                bindings.insert(def.name.clone(), v);
            }
        }
    }
    for (k, v) in module_scope.exports() {
        bindings.insert(k, v);
    }
    Ok(Arc::new(Module { name: compiled.name.clone(), bindings }))
}

fn exec_import(state: &mut State, s: &Import) -> Result<(), Error> {
    let name_val = eval_expr(state, &s.expr)?;
    let name = name_val.as_str().ok_or_else(|| Error::new(ErrorKind::TemplateError, "`import` target must evaluate to a string"))?.to_string();
    let module = render_module(state, &name, s.with_context)?;
    state.ctx.scope.set(&s.name, module.as_namespace_value());
    Ok(())
}

fn exec_from_import(state: &mut State, s: &FromImport) -> Result<(), Error> {
    let name_val = eval_expr(state, &s.expr)?;
    let name = name_val.as_str().ok_or_else(|| Error::new(ErrorKind::TemplateError, "`from` target must evaluate to a string"))?.to_string();
    let module = render_module(state, &name, s.with_context)?;
    bind_from_import(&module, &s.names, &state.ctx.scope, &name)
}

fn define_macro(state: &mut State, def: &MacroDef) {
    let mut defaults = Vec::with_capacity(def.defaults.len());
    for d in &def.defaults {
        defaults.push(match d {
            Some(e) => eval_expr(state, e).ok(),
            None => None,
        });
    }
    let mut kwonly_defaults = Vec::with_capacity(def.kwonly_defaults.len());
    for d in &def.kwonly_defaults {
        kwonly_defaults.push(match d {
            Some(e) => eval_expr(state, e).ok(),
            None => None,
        });
    }
    let macro_value = Arc::new(MacroValue {
        name: def.name.as_str().into(),
        params: def.params.clone(),
        defaults,
        kwonly_params: def.kwonly_params.clone(),
        kwonly_defaults,
        has_varargs: def.has_varargs,
        has_kwargs: def.has_kwargs,
        body: Arc::new(def.body.clone()),
        defining_template: state.ctx.template_name.clone(),
        closure: state.ctx.scope.clone(),
        references_caller: def.references_caller,
    });
    state.ctx.scope.set(&def.name, Value::Macro(macro_value));
}

fn exec_call_block(state: &mut State, s: &CallBlock) -> Result<(), Error> {
    let caller_defaults = s
        .caller_defaults
        .iter()
        .map(|d| d.as_ref().map(|e| eval_expr(state, e)).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    let caller = Arc::new(CallerRecord {
        params: s.caller_params.clone(),
        defaults: caller_defaults,
        body: Arc::new(s.body.clone()),
        scope: state.ctx.scope.clone(),
        template: state.ctx.template_name.clone(),
    });
    let (func, args, kwargs) = match &s.call {
        Expr::Call { func, args, kwargs } => (func.as_ref(), args.as_slice(), kwargs.as_slice()),
        _ => return Err(Error::new(ErrorKind::TemplateError, "call block target must be a call expression")),
    };
    let callee = eval_expr(state, func)?;
    let (call_args, call_kwargs) = eval_args_kwargs(state, args, kwargs)?;
    let result = call_value(state, &callee, &call_args, &call_kwargs, Some(caller))?;
    emit_escaped(state, state.ctx.autoescape, &result)?;
    Ok(())
}

/// Renders a `TransPart` sequence back into a message template using the
/// `%(name)s`/`%(name)d` placeholder syntax (§4.6), so the string handed to
/// `gettext`/`ngettext` is the same one a translator's catalog would key on.
fn trans_message_template(parts: &[TransPart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            TransPart::Text(t) => out.push_str(t),
            TransPart::Var(name) => {
                write!(out, "%({name})s").ok();
            }
        }
    }
    out
}

/// Substitutes `%(name)s|d|i|f|g` placeholders in a gettext-style message
/// template with the evaluated variable values (§4.6).
fn trans_substitute(template: &str, vars: &std::collections::HashMap<String, Value>) -> String {
    let mut out = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'(' {
            if let Some(close) = template[i + 2..].find(')') {
                let name_end = i + 2 + close;
                if name_end + 1 < template.len() {
                    let spec = template.as_bytes()[name_end + 1];
                    if matches!(spec, b's' | b'd' | b'i' | b'f' | b'g') {
                        let name = &template[i + 2..name_end];
                        if let Some(v) = vars.get(name) {
                            write!(out, "{v}").ok();
                        }
                        i = name_end + 2;
                        continue;
                    }
                }
            }
        }
        let ch = template[i..].chars().next().expect("i is a char boundary");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn exec_trans(state: &mut State, s: &Trans) -> Result<(), Error> {
    let mut vars = std::collections::HashMap::new();
    for (name, expr) in &s.vars {
        vars.insert(name.clone(), eval_expr(state, expr)?);
    }
    // Names referenced as `{{ x }}` directly inside the trans body, rather
    // than bound via `{% trans x=expr %}`, still resolve against the
    // surrounding scope (§4.6).
    for part in s.singular.iter().chain(s.plural.iter().flat_map(|(_, p)| p.iter())) {
        if let TransPart::Var(name) = part {
            if !vars.contains_key(name) {
                vars.insert(name.clone(), lookup_name(state, name)?);
            }
        }
    }
    if let Some((alias, _)) = &s.plural {
        if !vars.contains_key(alias) {
            vars.insert(alias.clone(), lookup_name(state, alias)?);
        }
    }
    let count = s
        .plural
        .as_ref()
        .and_then(|(alias, _)| vars.get(alias).and_then(Value::as_i64));

    let hooks = state.env.i18n();
    let rendered = match (&s.plural, count) {
        (Some((alias, plural_parts)), Some(n)) => {
            let singular_tmpl = trans_message_template(&s.singular);
            let plural_tmpl = trans_message_template(plural_parts);
            let translated = match (&s.context, &hooks.npgettext, &hooks.ngettext) {
                (Some(ctx), Some(npgettext), _) => npgettext(ctx, &singular_tmpl, &plural_tmpl, n),
                (None, _, Some(ngettext)) => ngettext(&singular_tmpl, &plural_tmpl, n),
                _ => {
                    if n == 1 {
                        singular_tmpl
                    } else {
                        plural_tmpl
                    }
                }
            };
            let mut vars_with_count = vars.clone();
            vars_with_count.entry(alias.clone()).or_insert(Value::Int(n));
            trans_substitute(&translated, &vars_with_count)
        }
        _ => {
            let tmpl = trans_message_template(&s.singular);
            let translated = match (&s.context, &hooks.pgettext, &hooks.gettext) {
                (Some(ctx), Some(pgettext), _) => pgettext(ctx, &tmpl),
                (None, _, Some(gettext)) => gettext(&tmpl),
                _ => tmpl,
            };
            trans_substitute(&translated, &vars)
        }
    };
    let trimmed = s.trimmed.unwrap_or_else(|| state.env.settings().i18n_trimmed);
    let text = if trimmed { crate::utils::collapse_whitespace(&rendered) } else { rendered };
    emit_escaped(state, state.ctx.autoescape, &Value::Str(text.into()))?;
    Ok(())
}
