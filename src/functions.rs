//! Built-in global functions (§4.6 supplemental: `range`/`dict`/`debug`, plus
//! the `namespace()` constructor used by `{% set ns = namespace(...) %}`).

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::environment::Environment;
use crate::error::{Error, ErrorKind};
use crate::eval::State;
use crate::value::{Key, Kwargs, Value};

fn g_range(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let (start, stop, step) = match args.len() {
        1 => (0i64, args[0].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?, 1i64),
        2 => (
            args[0].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?,
            args[1].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?,
            1i64,
        ),
        3 => (
            args[0].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?,
            args[1].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?,
            args[2].as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "range() requires integers"))?,
        ),
        _ => return Err(Error::new(ErrorKind::InvalidArguments, "range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "range() step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(Value::Int(i));
            i += step;
        }
    } else {
        while i > stop {
            out.push(Value::Int(i));
            i += step;
        }
    }
    Ok(Value::Seq(Arc::new(out)))
}

fn g_dict(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let mut map = crate::value::ValueMap::new();
    if let Some(Value::Map(existing)) = args.first() {
        for (k, v) in existing.iter() {
            map.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in kw {
        map.insert(Key::Str(k.as_str().into()), v.clone());
    }
    Ok(Value::Map(Arc::new(map)))
}

fn g_debug(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Str(format!("{:?}", args.first().unwrap_or(&Value::None)).into()))
}

fn g_namespace(_s: &mut State, _args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let mut map = IndexMap::new();
    for (k, v) in kw {
        map.insert(k.clone(), v.clone());
    }
    Ok(Value::Namespace(Arc::new(Mutex::new(map))))
}

/// Backs `url_for(...)` with the environment's `set-url-for` hook (§4.1);
/// with none installed, the call fails rather than silently returning an
/// empty string, since a template calling it is clearly expecting output.
fn g_url_for(s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    match s.env.url_for(args, kw) {
        Some(result) => result,
        None => Err(Error::new(
            ErrorKind::InvalidOperation,
            "url_for() called but no url_for callback is configured (see Environment::set_url_for)",
        )),
    }
}

/// Registers `range`, `dict`, `debug`, `namespace`, and `url_for` as
/// globals (mirrors `minijinja::defaults::get_globals`).
pub fn register(env: &Environment) {
    env.add_function("range", g_range);
    env.add_function("dict", g_dict);
    env.add_function("debug", g_debug);
    env.add_function("namespace", g_namespace);
    env.add_function("url_for", g_url_for);
}
