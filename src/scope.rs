//! Lexical scoping (§3 `Scope`).
//!
//! A [`Scope`] is a node in a linked chain of three string-keyed maps:
//! plain variables, `from x import *` exports, and block-scoped overrides.
//! Lookup walks plain -> exports -> overrides -> parent. `set` inside a
//! child scope never mutates a parent's plain map (§3 invariant); the only
//! way to affect an outer binding is through an explicit namespace
//! attribute assignment, which the evaluator handles separately by mutating
//! the `Value::Namespace` object directly rather than through scope lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::value::Value;

#[derive(Debug)]
pub struct Scope {
    plain: Mutex<HashMap<String, Value>>,
    exports: Mutex<HashMap<String, Value>>,
    overrides: Mutex<HashMap<String, Value>>,
    pub parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root() -> Arc<Scope> {
        Arc::new(Scope {
            plain: Mutex::new(HashMap::new()),
            exports: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Arc<Scope>) -> Arc<Scope> {
        Arc::new(Scope {
            plain: Mutex::new(HashMap::new()),
            exports: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn set(&self, name: &str, value: Value) {
        self.plain.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn set_export(&self, name: &str, value: Value) {
        self.exports.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn set_override(&self, name: &str, value: Value) {
        self.overrides.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn exports(&self) -> Vec<(String, Value)> {
        self.exports
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Looks up a name in this scope only (no parent walk).
    pub fn get_local(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.plain.lock().unwrap().get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.exports.lock().unwrap().get(name) {
            return Some(v.clone());
        }
        self.overrides.lock().unwrap().get(name).cloned()
    }

    /// Full chain lookup: plain -> exports -> overrides -> parent.
    pub fn lookup(self: &Arc<Scope>, name: &str) -> Option<Value> {
        let mut cur = self;
        loop {
            if let Some(v) = cur.get_local(name) {
                return Some(v);
            }
            match &cur.parent {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }
}
