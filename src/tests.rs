//! Built-in `is` tests and their alias table (§4.6).

use std::cmp::Ordering;

use regex::Regex;

use crate::environment::Environment;
use crate::error::{Error, ErrorKind};
use crate::eval::State;
use crate::value::{values_cmp, values_equal, Kwargs, Value};

fn arg(args: &[Value], idx: usize) -> Result<&Value, Error> {
    args.get(idx).ok_or_else(|| {
        Error::new(ErrorKind::InvalidArguments, format!("missing required argument {idx}"))
    })
}

fn t_defined(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(!arg(args, 0)?.is_undefined()))
}

fn t_undefined(s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    t_defined(s, args, kw).map(|v| Value::Bool(!v.is_true()))
}

fn t_none(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.is_none()))
}

fn t_boolean(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Bool(_))))
}

fn t_true(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Bool(true))))
}

fn t_false(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Bool(false))))
}

fn t_number(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Int(_) | Value::Float(_))))
}

fn t_integer(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Int(_))))
}

fn t_float(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Float(_))))
}

fn t_string(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Str(_) | Value::SafeStr(_))))
}

fn t_sequence(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Seq(_) | Value::Str(_) | Value::SafeStr(_))))
}

fn t_mapping(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Map(_) | Value::Namespace(_))))
}

fn t_iterable(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.try_iter().is_ok()))
}

fn t_callable(_s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    let v = arg(args, 0)?;
    if let Some(attr) = kw.get("attribute").and_then(Value::as_str) {
        return Ok(Value::Bool(matches!(v.get_attr(attr), Some(Value::Callable(..)) | Some(Value::Macro(_)))));
    }
    Ok(Value::Bool(matches!(v, Value::Callable(..) | Value::Macro(_))))
}

fn t_list(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Seq(_))))
}

fn t_dict(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Map(_))))
}

fn t_escaped(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.is_safe()))
}

fn t_module(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(matches!(arg(args, 0)?, Value::Namespace(_))))
}

fn t_lower(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = arg(args, 0)?.as_str().unwrap_or("");
    Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| !c.is_alphabetic() || c.is_lowercase())))
}

fn t_upper(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = arg(args, 0)?.as_str().unwrap_or("");
    Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| !c.is_alphabetic() || c.is_uppercase())))
}

fn t_even(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let i = arg(args, 0)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "even() requires an integer"))?;
    Ok(Value::Bool(i % 2 == 0))
}

fn t_odd(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let i = arg(args, 0)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "odd() requires an integer"))?;
    Ok(Value::Bool(i % 2 != 0))
}

fn t_divisibleby(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let i = arg(args, 0)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "divisibleby() requires an integer"))?;
    let n = arg(args, 1)?.as_i64().ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "divisibleby() requires an integer divisor"))?;
    if n == 0 {
        return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
    }
    Ok(Value::Bool(i % n == 0))
}

fn t_in(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 1)?.contains(arg(args, 0)?)?))
}

fn t_sameas(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(values_equal(arg(args, 0)?, arg(args, 1)?)))
}

fn t_eq(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(values_equal(arg(args, 0)?, arg(args, 1)?)))
}

fn t_ne(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(!values_equal(arg(args, 0)?, arg(args, 1)?)))
}

fn cmp_test(args: &[Value], ord: fn(Ordering) -> bool) -> Result<Value, Error> {
    let a = arg(args, 0)?;
    let b = arg(args, 1)?;
    Ok(Value::Bool(values_cmp(a, b).map(ord).unwrap_or(false)))
}

fn t_lt(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    cmp_test(args, Ordering::is_lt)
}

fn t_le(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    cmp_test(args, Ordering::is_le)
}

fn t_gt(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    cmp_test(args, Ordering::is_gt)
}

fn t_ge(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    cmp_test(args, Ordering::is_ge)
}

fn t_matching(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = arg(args, 0)?.as_str().unwrap_or("");
    let pattern = arg(args, 1)?.as_str().unwrap_or("");
    let re = Regex::new(pattern).map_err(|e| Error::new(ErrorKind::InvalidArguments, e.to_string()))?;
    Ok(Value::Bool(re.is_match(s)))
}

fn t_search(s: &mut State, args: &[Value], kw: &Kwargs) -> Result<Value, Error> {
    t_matching(s, args, kw)
}

fn t_startingwith(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = arg(args, 0)?.as_str().unwrap_or("");
    let prefix = arg(args, 1)?.as_str().unwrap_or("");
    Ok(Value::Bool(s.starts_with(prefix)))
}

fn t_endingwith(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let s = arg(args, 0)?.as_str().unwrap_or("");
    let suffix = arg(args, 1)?.as_str().unwrap_or("");
    Ok(Value::Bool(s.ends_with(suffix)))
}

fn t_containing(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.contains(arg(args, 1)?)?))
}

fn t_infinite(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.as_f64().map(f64::is_infinite).unwrap_or(false)))
}

fn t_nan(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.as_f64().map(f64::is_nan).unwrap_or(false)))
}

fn t_finite(_s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    Ok(Value::Bool(arg(args, 0)?.as_f64().map(f64::is_finite).unwrap_or(false)))
}

fn t_filter(s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let name = arg(args, 0)?.as_str().unwrap_or("");
    Ok(Value::Bool(s.env.get_filter(name).is_some()))
}

fn t_test(s: &mut State, args: &[Value], _kw: &Kwargs) -> Result<Value, Error> {
    let name = arg(args, 0)?.as_str().unwrap_or("");
    Ok(Value::Bool(s.env.get_test(name).is_some()))
}

/// Registers every built-in test, including the alias table in §4.6.
pub fn register(env: &Environment) {
    env.add_test("defined", t_defined);
    env.add_test("undefined", t_undefined);
    env.add_test("none", t_none);
    env.add_test("boolean", t_boolean);
    env.add_test("true", t_true);
    env.add_test("false", t_false);
    env.add_test("number", t_number);
    env.add_test("integer", t_integer);
    env.add_test("float", t_float);
    env.add_test("string", t_string);
    env.add_test("sequence", t_sequence);
    env.add_test("mapping", t_mapping);
    env.add_test("iterable", t_iterable);
    env.add_test("callable", t_callable);
    env.add_test("list", t_list);
    env.add_test("tuple", t_list);
    env.add_test("dict", t_dict);
    env.add_test("escaped", t_escaped);
    env.add_test("module", t_module);
    env.add_test("lower", t_lower);
    env.add_test("upper", t_upper);
    env.add_test("even", t_even);
    env.add_test("odd", t_odd);
    env.add_test("divisibleby", t_divisibleby);
    env.add_test("in", t_in);
    env.add_test("sameas", t_sameas);
    env.add_test("eq", t_eq);
    env.add_test("==", t_eq);
    env.add_test("equalto", t_eq);
    env.add_test("ne", t_ne);
    env.add_test("!=", t_ne);
    env.add_test("lt", t_lt);
    env.add_test("<", t_lt);
    env.add_test("lessthan", t_lt);
    env.add_test("le", t_le);
    env.add_test("<=", t_le);
    env.add_test("gt", t_gt);
    env.add_test(">", t_gt);
    env.add_test("greaterthan", t_gt);
    env.add_test("ge", t_ge);
    env.add_test(">=", t_ge);
    env.add_test("matching", t_matching);
    env.add_test("search", t_search);
    env.add_test("startingwith", t_startingwith);
    env.add_test("endingwith", t_endingwith);
    env.add_test("containing", t_containing);
    env.add_test("infinite", t_infinite);
    env.add_test("nan", t_nan);
    env.add_test("finite", t_finite);
    env.add_test("filter", t_filter);
    env.add_test("test", t_test);
}
