//! Arithmetic and coercion rules (§4.6).

use std::sync::Arc;

use super::Value;
use crate::error::{Error, ErrorKind};

fn unsupported(op: &str, a: &Value, b: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperationArithmetic,
        format!(
            "unsupported operand types for {op}: {} and {}",
            a.type_name(),
            b.type_name()
        ),
    )
}

/// True if both operands are integral (bool counts as integral, matching
/// Python's `bool` being an `int` subtype).
fn both_int(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((*x, *y)),
        (Value::Bool(x), Value::Int(y)) => Some((*x as i64, *y)),
        (Value::Int(x), Value::Bool(y)) => Some((*x, *y as i64)),
        (Value::Bool(x), Value::Bool(y)) => Some((*x as i64, *y as i64)),
        _ => None,
    }
}

pub fn add(a: &Value, b: &Value) -> Result<Value, Error> {
    if let (Value::Str(x) | Value::SafeStr(x), Value::Str(y) | Value::SafeStr(y)) = (a, b) {
        let mut s = String::with_capacity(x.len() + y.len());
        s.push_str(x);
        s.push_str(y);
        return Ok(Value::Str(s.into()));
    }
    if matches!(a, Value::Str(_) | Value::SafeStr(_)) != matches!(b, Value::Str(_) | Value::SafeStr(_))
        && (matches!(a, Value::Str(_) | Value::SafeStr(_)) || matches!(b, Value::Str(_) | Value::SafeStr(_)))
    {
        return Err(unsupported("+", a, b));
    }
    if let (Value::Seq(x), Value::Seq(y)) = (a, b) {
        let mut v = x.as_ref().clone();
        v.extend(y.as_ref().iter().cloned());
        return Ok(Value::Seq(Arc::new(v)));
    }
    if let Some((x, y)) = both_int(a, b) {
        return Ok(Value::Int(x.wrapping_add(y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(x + y)),
        _ => Err(unsupported("+", a, b)),
    }
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, Error> {
    if let Some((x, y)) = both_int(a, b) {
        return Ok(Value::Int(x.wrapping_sub(y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(x - y)),
        _ => Err(unsupported("-", a, b)),
    }
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, Error> {
    // `string * integer` repeats the string.
    if let (Value::Str(s) | Value::SafeStr(s), Value::Int(n)) | (Value::Int(n), Value::Str(s) | Value::SafeStr(s)) = (a, b) {
        if *n < 0 {
            return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "cannot repeat string a negative number of times"));
        }
        return Ok(Value::Str(s.repeat(*n as usize).into()));
    }
    if let Some((x, y)) = both_int(a, b) {
        return Ok(Value::Int(x.wrapping_mul(y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(x * y)),
        _ => Err(unsupported("*", a, b)),
    }
}

/// True division: always produces a float, except when both operands are
/// integers and divide evenly, matching §4.6 ("int÷int where the result is
/// not exact produces a float... integer÷integer is true division").
pub fn div(a: &Value, b: &Value) -> Result<Value, Error> {
    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(unsupported("/", a, b)),
    };
    if y == 0.0 {
        return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
    }
    Ok(Value::Float(x / y))
}

/// Floor division, Python semantics: `-3 // 2 == -2`.
pub fn floordiv(a: &Value, b: &Value) -> Result<Value, Error> {
    if let Some((x, y)) = both_int(a, b) {
        if y == 0 {
            return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
        }
        let q = x / y;
        let r = x % y;
        let q = if r != 0 && (r < 0) != (y < 0) { q - 1 } else { q };
        return Ok(Value::Int(q));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
            }
            Ok(Value::Float((x / y).floor()))
        }
        _ => Err(unsupported("//", a, b)),
    }
}

/// Modulo, Python semantics: sign of result equals sign of divisor.
pub fn modulo(a: &Value, b: &Value) -> Result<Value, Error> {
    if let Some((x, y)) = both_int(a, b) {
        if y == 0 {
            return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
        }
        let r = x % y;
        let r = if r != 0 && (r < 0) != (y < 0) { r + y } else { r };
        return Ok(Value::Int(r));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                return Err(Error::new(ErrorKind::InvalidOperationArithmetic, "division by zero"));
            }
            let r = x % y;
            let r = if r != 0.0 && r.is_sign_positive() != y.is_sign_positive() { r + y } else { r };
            Ok(Value::Float(r))
        }
        _ => Err(unsupported("%", a, b)),
    }
}

pub fn pow(a: &Value, b: &Value) -> Result<Value, Error> {
    if let Some((x, y)) = both_int(a, b) {
        if y < 0 {
            return Ok(Value::Float((x as f64).powf(y as f64)));
        }
        return match u32::try_from(y) {
            Ok(exp) => Ok(Value::Int(x.wrapping_pow(exp))),
            Err(_) => Ok(Value::Float((x as f64).powf(y as f64))),
        };
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(x.powf(y))),
        _ => Err(unsupported("**", a, b)),
    }
}

pub fn concat(a: &Value, b: &Value) -> Result<Value, Error> {
    Ok(Value::Str(format!("{a}{b}").into()))
}
