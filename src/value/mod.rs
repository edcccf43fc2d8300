//! The dynamic value model (§3 Data Model: `Value`, `Undefined`, `LoopRecord`).

mod key;
mod ops;
mod ser;

pub use key::Key;
pub use ops::{add, concat, div, floordiv, modulo, mul, pow, sub};
pub use ser::to_value;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::ast::Body;
use crate::error::{Error, ErrorKind};

pub type ValueMap = IndexMap<Key, Value>;
pub type Kwargs = BTreeMap<String, Value>;

/// The strictness policy of an [`Undefined`](Value::Undefined) sentinel (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedKind {
    /// Renders as empty string; permits any operation silently.
    Debug,
    /// Attribute/index access yields another undefined of the same kind.
    Chainable,
    /// Any observation (render, truthiness, attribute access, arithmetic) fails.
    Strict,
}

#[derive(Debug)]
pub struct UndefinedInner {
    pub name: Option<Arc<str>>,
    pub kind: UndefinedKind,
    pub hint: Option<Arc<str>>,
}

/// The callable signature every registered filter, test, global function and
/// host callback shares: `(state, positional args, keyword args) -> Value`.
pub type NativeFunc = dyn Fn(&mut crate::eval::State, &[Value], &Kwargs) -> Result<Value, Error>
    + Send
    + Sync;

#[derive(Debug)]
pub struct MacroValue {
    pub name: Arc<str>,
    pub params: Vec<String>,
    pub defaults: Vec<Option<Value>>,
    pub kwonly_params: Vec<String>,
    pub kwonly_defaults: Vec<Option<Value>>,
    pub has_varargs: bool,
    pub has_kwargs: bool,
    pub body: Arc<Body>,
    pub defining_template: Arc<str>,
    /// The defining template's module scope, captured at definition time.
    /// `caller()` macros imported "with context" instead close over the
    /// call-site scope (handled by the import manager, not here).
    pub closure: Arc<crate::scope::Scope>,
    pub references_caller: bool,
}

#[derive(Debug)]
pub struct LoopRecordState {
    pub index0: usize,
    pub len: usize,
    pub depth0: usize,
    pub last_changed: Mutex<Option<Vec<Value>>>,
}

impl LoopRecordState {
    pub fn get_field(&self, name: &str) -> Option<Value> {
        let idx = self.index0 as i64;
        let len = self.len as i64;
        match name {
            "index0" => Some(Value::Int(idx)),
            "index" => Some(Value::Int(idx + 1)),
            "revindex" => Some(Value::Int(len - idx)),
            "revindex0" => Some(Value::Int(len - idx - 1)),
            "first" => Some(Value::Bool(idx == 0)),
            "last" => Some(Value::Bool(len == 0 || idx == len - 1)),
            "length" => Some(Value::Int(len)),
            "depth" => Some(Value::Int(self.depth0 as i64 + 1)),
            "depth0" => Some(Value::Int(self.depth0 as i64)),
            "previtem" | "nextitem" => None, // filled in by the evaluator, which knows the sequence
            _ => None,
        }
    }

    pub fn cycle(&self, args: &[Value]) -> Result<Value, Error> {
        if args.is_empty() {
            return Err(Error::new(
                ErrorKind::TemplateError,
                "loop.cycle() requires at least one argument",
            ));
        }
        Ok(args[self.index0 % args.len()].clone())
    }

    pub fn changed(&self, values: Vec<Value>) -> bool {
        let mut last = self.last_changed.lock().unwrap();
        let changed = last.as_ref() != Some(&values);
        if changed {
            *last = Some(values);
        }
        changed
    }
}

/// The tagged value variants of §3.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A string explicitly flagged as already safe for output (markup).
    SafeStr(Arc<str>),
    Seq(Arc<Vec<Value>>),
    Map(Arc<ValueMap>),
    Set(Arc<indexmap::IndexSet<Key>>),
    /// A mutable, string-keyed record (`{% set ns = namespace(...) %}`).
    Namespace(Arc<Mutex<IndexMap<String, Value>>>),
    Macro(Arc<MacroValue>),
    Callable(Arc<NativeFunc>, Arc<str>),
    /// An opaque deferred value; only meaningful with `enable_async`.
    Awaitable(Arc<Value>),
    Loop(Arc<LoopRecordState>),
    Undefined(Arc<UndefinedInner>),
}

impl Value {
    pub fn undefined(name: impl Into<Arc<str>>, kind: UndefinedKind) -> Value {
        Value::Undefined(Arc::new(UndefinedInner {
            name: Some(name.into()),
            kind,
            hint: None,
        }))
    }

    pub fn undefined_with_hint(name: impl Into<Arc<str>>, kind: UndefinedKind, hint: impl Into<Arc<str>>) -> Value {
        Value::Undefined(Arc::new(UndefinedInner {
            name: Some(name.into()),
            kind,
            hint: Some(hint.into()),
        }))
    }

    pub fn from_safe_string(s: String) -> Value {
        Value::SafeStr(s.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Value::SafeStr(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::SafeStr(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_i64().and_then(|v| usize::try_from(v).ok())
    }

    /// Truthiness per §4.6: empty string/zero/empty collection/none/undefined => false.
    pub fn is_true(&self) -> bool {
        match self {
            Value::None | Value::Undefined(_) => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) | Value::SafeStr(s) => !s.is_empty(),
            Value::Seq(s) => !s.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Set(s) => !s.is_empty(),
            Value::Namespace(_) => true,
            Value::Macro(_) | Value::Callable(..) => true,
            Value::Awaitable(inner) => inner.is_true(),
            Value::Loop(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) | Value::SafeStr(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Set(_) => "set",
            Value::Namespace(_) => "namespace",
            Value::Macro(_) => "macro",
            Value::Callable(..) => "callable",
            Value::Awaitable(_) => "awaitable",
            Value::Loop(_) => "loop",
            Value::Undefined(_) => "undefined",
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) | Value::SafeStr(s) => Some(s.len()),
            Value::Seq(s) => Some(s.len()),
            Value::Map(m) => Some(m.len()),
            Value::Set(s) => Some(s.len()),
            Value::Namespace(n) => Some(n.lock().unwrap().len()),
            _ => None,
        }
    }

    /// Materializes anything iterable into a concrete sequence. Required by
    /// `for` loops (§4.6) so `loop.length` is known before the first item.
    pub fn try_iter(&self) -> Result<Vec<Value>, Error> {
        match self {
            Value::Seq(s) => Ok(s.as_ref().clone()),
            Value::Map(m) => Ok(m.keys().map(Key::to_value).collect()),
            Value::Set(s) => Ok(s.iter().map(Key::to_value).collect()),
            Value::Str(s) | Value::SafeStr(s) => {
                Ok(s.chars().map(|c| Value::Str(c.to_string().into())).collect())
            }
            Value::Undefined(u) if u.kind != UndefinedKind::Strict => Ok(Vec::new()),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("{} is not iterable", self.type_name()),
            )),
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        match self {
            Value::Namespace(ns) => ns.lock().unwrap().get(name).cloned(),
            Value::Map(m) => m.get(&Key::Str(name.into())).cloned(),
            Value::Loop(state) => state.get_field(name),
            _ => None,
        }
    }

    pub fn get_item(&self, index: &Value) -> Result<Value, Error> {
        match self {
            Value::Map(m) => {
                let key = Key::from_value(index).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "invalid mapping key type")
                })?;
                Ok(m.get(&key).cloned().unwrap_or_else(|| {
                    Value::undefined(format!("{key}"), UndefinedKind::Chainable)
                }))
            }
            Value::Seq(s) => {
                let i = index
                    .as_i64()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "sequence indices must be integers"))?;
                let len = s.len() as i64;
                let real = if i < 0 { len + i } else { i };
                if real < 0 || real >= len {
                    return Err(Error::new(ErrorKind::RangeError, "index out of range"));
                }
                Ok(s[real as usize].clone())
            }
            Value::Str(st) | Value::SafeStr(st) => {
                let i = index
                    .as_i64()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "string indices must be integers"))?;
                let bytes = st.as_bytes();
                let len = bytes.len() as i64;
                let real = if i < 0 { len + i } else { i };
                if real < 0 || real >= len {
                    return Err(Error::new(ErrorKind::RangeError, "index out of range"));
                }
                // byte-offset indexing (§9 open question); documented choice.
                Ok(Value::Str(String::from_utf8_lossy(&bytes[real as usize..real as usize + 1]).into_owned().into()))
            }
            Value::Namespace(ns) => {
                let key = index.as_str().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "namespace keys must be strings")
                })?;
                Ok(ns
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| Value::undefined(key.to_string(), UndefinedKind::Chainable)))
            }
            Value::Undefined(u) if u.kind == UndefinedKind::Chainable => Ok(self.clone()),
            Value::Undefined(_) => Err(Error::new(ErrorKind::UndefinedError, "cannot index undefined value")),
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot index into {}", self.type_name()),
            )),
        }
    }

    /// Dispatches the handful of built-in methods Jinja2 templates call
    /// directly on mappings and strings (`dict.items()`, `str.upper()`, ...)
    /// rather than through a filter.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        match (self, name) {
            (Value::Map(m), "items") => Ok(Value::Seq(Arc::new(
                m.iter().map(|(k, v)| Value::Seq(Arc::new(vec![k.to_value(), v.clone()]))).collect(),
            ))),
            (Value::Map(m), "keys") => Ok(Value::Seq(Arc::new(m.keys().map(Key::to_value).collect()))),
            (Value::Map(m), "values") => Ok(Value::Seq(Arc::new(m.values().cloned().collect()))),
            (Value::Map(m), "get") => {
                let key = args.first().and_then(Key::from_value).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "get() requires a hashable key")
                })?;
                Ok(m.get(&key).cloned().unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            (Value::Str(s) | Value::SafeStr(s), "upper") => Ok(Value::Str(s.to_uppercase().into())),
            (Value::Str(s) | Value::SafeStr(s), "lower") => Ok(Value::Str(s.to_lowercase().into())),
            (Value::Str(s) | Value::SafeStr(s), "strip") => Ok(Value::Str(s.trim().to_string().into())),
            (Value::Str(s) | Value::SafeStr(s), "title") => Ok(Value::Str(title_case(s).into())),
            (Value::Str(s) | Value::SafeStr(s), "capitalize") => {
                let mut chars = s.chars();
                let cap = match chars.next() {
                    Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                    None => String::new(),
                };
                Ok(Value::Str(cap.into()))
            }
            (Value::Str(s) | Value::SafeStr(s), "split") => {
                let sep = args.first().and_then(Value::as_str);
                let parts: Vec<Value> = match sep {
                    Some(sep) => s.split(sep).map(|p| Value::Str(p.into())).collect(),
                    None => s.split_whitespace().map(|p| Value::Str(p.into())).collect(),
                };
                Ok(Value::Seq(Arc::new(parts)))
            }
            (Value::Str(s) | Value::SafeStr(s), "startswith") => {
                let needle = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(Value::Bool(s.starts_with(needle)))
            }
            (Value::Str(s) | Value::SafeStr(s), "endswith") => {
                let needle = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(Value::Bool(s.ends_with(needle)))
            }
            (Value::Namespace(ns), "get") => {
                let key = args.first().and_then(Value::as_str).unwrap_or_default();
                Ok(ns.lock().unwrap().get(key).cloned().unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            (Value::Loop(state), "cycle") => state.cycle(args),
            (Value::Loop(state), "changed") => Ok(Value::Bool(state.changed(args.to_vec()))),
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("{} has no method named `{name}`", self.type_name()),
            )),
        }
    }

    pub fn contains(&self, needle: &Value) -> Result<bool, Error> {
        match self {
            Value::Map(m) => Ok(Key::from_value(needle).map(|k| m.contains_key(&k)).unwrap_or(false)),
            Value::Set(s) => Ok(Key::from_value(needle).map(|k| s.contains(&k)).unwrap_or(false)),
            Value::Seq(s) => Ok(s.iter().any(|v| values_equal(v, needle))),
            Value::Str(st) | Value::SafeStr(st) => {
                let needle = needle.as_str().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "cannot check string containment of non-string")
                })?;
                Ok(st.contains(needle))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot perform containment check on {}", self.type_name()),
            )),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(fl) => write!(f, "{fl}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::SafeStr(s) => write!(f, "Safe({s:?})"),
            Value::Seq(s) => f.debug_list().entries(s.iter()).finish(),
            Value::Map(m) => f.debug_map().entries(m.iter().map(|(k, v)| (k.to_string(), v))).finish(),
            Value::Set(s) => f.debug_set().entries(s.iter().map(|k| k.to_string())).finish(),
            Value::Namespace(_) => write!(f, "<namespace>"),
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
            Value::Callable(_, name) => write!(f, "<function {name}>"),
            Value::Awaitable(_) => write!(f, "<awaitable>"),
            Value::Loop(_) => write!(f, "<loop>"),
            Value::Undefined(u) => write!(f, "Undefined({:?})", u.name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(fl) => {
                if fl.is_infinite() {
                    write!(f, "{}inf", if *fl < 0.0 { "-" } else { "" })
                } else if fl.is_nan() {
                    write!(f, "nan")
                } else if fl.fract() == 0.0 && fl.abs() < 1e16 {
                    write!(f, "{fl:.1}")
                } else {
                    write!(f, "{fl}")
                }
            }
            Value::Str(s) | Value::SafeStr(s) => write!(f, "{s}"),
            Value::Seq(s) => {
                write!(f, "[")?;
                for (i, v) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", ReprValue(v))?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k.to_string(), ReprValue(v))?;
                }
                write!(f, "}}")
            }
            Value::Set(s) => {
                write!(f, "{{")?;
                for (i, k) in s.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}")?;
                }
                write!(f, "}}")
            }
            Value::Namespace(_) => write!(f, "<namespace>"),
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
            Value::Callable(_, name) => write!(f, "<function {name}>"),
            Value::Awaitable(inner) => write!(f, "{inner}"),
            Value::Loop(_) => write!(f, "<loop>"),
            Value::Undefined(u) => match u.kind {
                UndefinedKind::Strict => Ok(()), // caller must have already errored
                _ => Ok(()),
            },
        }
    }
}

struct ReprValue<'a>(&'a Value);

impl fmt::Display for ReprValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Str(s) | Value::SafeStr(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Undefined(_), Value::Undefined(_)) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x) | Value::SafeStr(x), Value::Str(y) | Value::SafeStr(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|v2| values_equal(v, v2)).unwrap_or(false))
        }
        (Value::Set(x), Value::Set(y)) => x == y,
        _ => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                x == y
            } else {
                false
            }
        }
    }
}

pub fn values_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::Str(x) | Value::SafeStr(x), Value::Str(y) | Value::SafeStr(y)) => Some(x.cmp(y)),
        (Value::Seq(x), Value::Seq(y)) => Some(x.iter().map(key_or).collect::<Vec<_>>().cmp(&y.iter().map(key_or).collect::<Vec<_>>())),
        _ => None,
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut start_of_word = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(if start_of_word { c.to_uppercase().next() } else { c.to_lowercase().next() });
            start_of_word = false;
        } else {
            out.push(c);
            start_of_word = true;
        }
    }
    out
}

// Small helper so sequences of mixed-but-ordinal values can still be compared
// lexicographically by falling back to their Key projection when possible.
fn key_or(v: &Value) -> Key {
    Key::from_value(v).unwrap_or(Key::None)
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Value {
        Value::Int(i as i64)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Value {
        Value::Seq(Arc::new(v.into_iter().map(Into::into).collect()))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            Some(v) => v.into(),
            None => Value::None,
        }
    }
}
