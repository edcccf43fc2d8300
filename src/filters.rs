//! Built-in filters (§4.6, SUPPLEMENTAL FEATURES default catalog).
//!
//! Every filter has the fixed `(state, args, kwargs) -> Value` signature
//! shared with tests and global functions; the first positional argument is
//! always the piped value.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{Error, ErrorKind};
use crate::eval::State;
use crate::utils::html_escape;
use crate::value::{values_cmp, Key, Kwargs, Value};

fn arg(args: &[Value], idx: usize) -> Result<&Value, Error> {
    args.get(idx).ok_or_else(|| {
        Error::new(ErrorKind::InvalidArguments, format!("missing required argument {idx}"))
    })
}

fn want_str(v: &Value) -> Result<&str, Error> {
    v.as_str().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, format!("expected a string, got {}", v.type_name())))
}

fn f_upper(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Str(want_str(arg(args, 0)?)?.to_uppercase().into()))
}

fn f_lower(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Str(want_str(arg(args, 0)?)?.to_lowercase().into()))
}

fn f_title(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    arg(args, 0)?.call_method("title", &[])
}

fn f_capitalize(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = want_str(arg(args, 0)?)?;
    let mut chars = s.chars();
    let cap = match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    };
    Ok(Value::Str(cap.into()))
}

fn f_trim(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let s = want_str(arg(args, 0)?)?;
    match kw.get("chars").and_then(Value::as_str) {
        Some(chars) => Ok(Value::Str(s.trim_matches(|c| chars.contains(c)).to_string().into())),
        None => Ok(Value::Str(s.trim().to_string().into())),
    }
}

fn f_replace(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = want_str(arg(args, 0)?)?;
    let old = want_str(arg(args, 1)?)?;
    let new = want_str(arg(args, 2)?)?;
    Ok(Value::Str(s.replace(old, new).into()))
}

fn f_length(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    arg(args, 0)?
        .len()
        .map(|n| Value::Int(n as i64))
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, format!("{} has no length", arg(args, 0).unwrap().type_name())))
}

fn f_join(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    let sep = args.get(1).and_then(Value::as_str).unwrap_or("");
    let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
    Ok(Value::Str(parts.join(sep).into()))
}

fn f_default(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let value = arg(args, 0)?;
    let default = args.get(1).cloned().unwrap_or(Value::Str("".into()));
    let also_false = kw.get("boolean").map(Value::is_true).unwrap_or(false)
        || args.get(2).map(Value::is_true).unwrap_or(false);
    if value.is_undefined() || (also_false && !value.is_true()) {
        Ok(default)
    } else {
        Ok(value.clone())
    }
}

fn f_first(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    Ok(items.into_iter().next().unwrap_or(Value::undefined("first", crate::value::UndefinedKind::Chainable)))
}

fn f_last(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    Ok(items.into_iter().next_back().unwrap_or(Value::undefined("last", crate::value::UndefinedKind::Chainable)))
}

fn f_reverse(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    match arg(args, 0)? {
        Value::Str(s) | Value::SafeStr(s) => Ok(Value::Str(s.chars().rev().collect::<String>().into())),
        other => {
            let mut items = other.try_iter()?;
            items.reverse();
            Ok(Value::Seq(Arc::new(items)))
        }
    }
}

fn f_sort(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let mut items = arg(args, 0)?.try_iter()?;
    let reverse = kw.get("reverse").map(Value::is_true).unwrap_or(false);
    let attribute = kw.get("attribute").and_then(Value::as_str).map(str::to_string);
    items.sort_by(|a, b| {
        let (ka, kb) = match &attribute {
            Some(attr) => (a.get_attr(attr).unwrap_or(Value::None), b.get_attr(attr).unwrap_or(Value::None)),
            None => (a.clone(), b.clone()),
        };
        values_cmp(&ka, &kb).unwrap_or(Ordering::Equal)
    });
    if reverse {
        items.reverse();
    }
    Ok(Value::Seq(Arc::new(items)))
}

fn f_list(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Seq(Arc::new(arg(args, 0)?.try_iter()?)))
}

fn f_round(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let v = arg(args, 0)?.as_f64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "round() requires a number"))?;
    let precision = args.get(1).and_then(Value::as_i64).unwrap_or(0);
    let factor = 10f64.powi(precision as i32);
    Ok(Value::Float((v * factor).round() / factor))
}

fn f_abs(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    match arg(args, 0)? {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        other => other
            .as_f64()
            .map(|f| Value::Float(f.abs()))
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "abs() requires a number")),
    }
}

fn f_min(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    Ok(items.into_iter().min_by(|a, b| values_cmp(a, b).unwrap_or(Ordering::Equal)).unwrap_or(Value::None))
}

fn f_max(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    Ok(items.into_iter().max_by(|a, b| values_cmp(a, b).unwrap_or(Ordering::Equal)).unwrap_or(Value::None))
}

fn f_escape(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let v = arg(args, 0)?;
    if v.is_safe() {
        return Ok(v.clone());
    }
    let mut out = String::new();
    html_escape(&mut out, &v.to_string())?;
    Ok(Value::from_safe_string(out))
}

fn f_safe(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::from_safe_string(arg(args, 0)?.to_string()))
}

fn f_attr(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let name = want_str(arg(args, 1)?)?;
    Ok(arg(args, 0)?
        .get_attr(name)
        .unwrap_or_else(|| Value::undefined(name.to_string(), crate::value::UndefinedKind::Chainable)))
}

fn f_items(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    arg(args, 0)?.call_method("items", &[])
}

fn f_count(state: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    f_length(state, args, kw)
}

#[cfg(feature = "json")]
fn f_tojson(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let pretty = kw.get("indent").is_some();
    let text = if pretty {
        serde_json::to_string_pretty(arg(args, 0)?)
    } else {
        serde_json::to_string(arg(args, 0)?)
    }
    .map_err(|e| Error::new(ErrorKind::BadSerialization, e.to_string()))?;
    Ok(Value::from_safe_string(text))
}

#[cfg(feature = "urlencode")]
fn f_urlencode(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = want_str(arg(args, 0)?)?;
    Ok(Value::Str(percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string().into()))
}

fn f_unique(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    let mut seen = indexmap::IndexSet::new();
    let mut out = Vec::new();
    for item in items {
        if let Some(key) = Key::from_value(&item) {
            if seen.insert(key) {
                out.push(item);
            }
        } else {
            out.push(item);
        }
    }
    Ok(Value::Seq(Arc::new(out)))
}

fn f_map(state: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    if let Some(attr) = kw.get("attribute").and_then(Value::as_str) {
        return Ok(Value::Seq(Arc::new(
            items
                .into_iter()
                .map(|v| v.get_attr(attr).unwrap_or(Value::undefined(attr.to_string(), crate::value::UndefinedKind::Chainable)))
                .collect(),
        )));
    }
    let filter_name = want_str(arg(args, 1)?)?;
    let f = state.env.get_filter(filter_name).ok_or_else(|| {
        Error::new(ErrorKind::UnknownFilter, format!("no filter named `{filter_name}`"))
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(f(state, &[item], &Kwargs::new())?);
    }
    Ok(Value::Seq(Arc::new(out)))
}

fn f_select(state: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    select_impl(state, args, kw, true)
}

fn f_reject(state: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    select_impl(state, args, kw, false)
}

fn select_impl(state: &mut State, args: &[Value], _kw: &Kwargs, keep_on_true: bool) -> Result<Value, Error> {
    let items = arg(args, 0)?.try_iter()?;
    let mut out = Vec::new();
    match args.get(1).and_then(Value::as_str) {
        Some(test_name) => {
            let test = state.env.get_test(test_name).ok_or_else(|| {
                Error::new(ErrorKind::UnknownTest, format!("no test named `{test_name}`"))
            })?;
            let rest = &args[2..];
            for item in items {
                let mut call_args = vec![item.clone()];
                call_args.extend_from_slice(rest);
                if test(state, &call_args, &Kwargs::new())?.is_true() == keep_on_true {
                    out.push(item);
                }
            }
        }
        None => {
            for item in items {
                if item.is_true() == keep_on_true {
                    out.push(item);
                }
            }
        }
    }
    Ok(Value::Seq(Arc::new(out)))
}

/// Registers every built-in filter into `env` (mirrors
/// `minijinja::defaults::get_builtin_filters`).
pub fn register(env: &Environment) {
    env.add_filter("upper", f_upper);
    env.add_filter("lower", f_lower);
    env.add_filter("title", f_title);
    env.add_filter("capitalize", f_capitalize);
    env.add_filter("trim", f_trim);
    env.add_filter("replace", f_replace);
    env.add_filter("length", f_length);
    env.add_filter("count", f_count);
    env.add_filter("join", f_join);
    env.add_filter("default", f_default);
    env.add_filter("d", f_default);
    env.add_filter("first", f_first);
    env.add_filter("last", f_last);
    env.add_filter("reverse", f_reverse);
    env.add_filter("sort", f_sort);
    env.add_filter("list", f_list);
    env.add_filter("round", f_round);
    env.add_filter("abs", f_abs);
    env.add_filter("min", f_min);
    env.add_filter("max", f_max);
    env.add_filter("escape", f_escape);
    env.add_filter("e", f_escape);
    env.add_filter("safe", f_safe);
    env.add_filter("attr", f_attr);
    env.add_filter("items", f_items);
    env.add_filter("unique", f_unique);
    env.add_filter("map", f_map);
    env.add_filter("select", f_select);
    env.add_filter("reject", f_reject);
    #[cfg(feature = "json")]
    env.add_filter("tojson", f_tojson);
    #[cfg(feature = "urlencode")]
    env.add_filter("urlencode", f_urlencode);
}
