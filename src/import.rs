//! `{% import %}` / `{% from ... import ... %}` (§5).
//!
//! Importing a template renders it in isolation (its own root scope, no
//! access to the importer's locals unless `with context` is given) and
//! exposes whatever it bound at module scope — macros, and any top-level
//! variable the module set — as a namespace-like [`Module`]. Modules are
//! cached per render so importing the same template twice is one render,
//! not two (§5 invariant).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::scope::Scope;
use crate::value::Value;

/// The bindings a rendered module exposed at its top level.
pub struct Module {
    pub name: Arc<str>,
    pub bindings: HashMap<String, Value>,
}

impl Module {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }

    pub fn as_namespace_value(self: &Arc<Module>) -> Value {
        let mut map = indexmap::IndexMap::new();
        for (k, v) in &self.bindings {
            map.insert(crate::value::Key::Str(k.as_str().into()), v.clone());
        }
        Value::Map(Arc::new(map))
    }
}

/// Tracks in-flight and completed module renders for one top-level render,
/// detecting import cycles and memoizing repeated imports.
pub struct ImportManager {
    cache: Mutex<HashMap<String, Arc<Module>>>,
    in_progress: Mutex<Vec<String>>,
}

impl ImportManager {
    pub fn new() -> Arc<ImportManager> {
        Arc::new(ImportManager {
            cache: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(Vec::new()),
        })
    }

    pub fn cached(&self, name: &str) -> Option<Arc<Module>> {
        self.cache.lock().unwrap().get(name).cloned()
    }

    pub fn store(&self, name: &str, module: Arc<Module>) {
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), module);
    }

    /// Marks `name` as currently being rendered; returns an `ImportError`
    /// if it's already on the stack (a cycle).
    pub fn enter(&self, name: &str) -> Result<(), Error> {
        let mut stack = self.in_progress.lock().unwrap();
        if stack.iter().any(|n| n == name) {
            let mut chain = stack.clone();
            chain.push(name.to_string());
            return Err(Error::new(
                ErrorKind::ImportError,
                format!("circular import detected: {}", chain.join(" -> ")),
            ));
        }
        stack.push(name.to_string());
        Ok(())
    }

    pub fn exit(&self, name: &str) {
        let mut stack = self.in_progress.lock().unwrap();
        if let Some(pos) = stack.iter().rposition(|n| n == name) {
            stack.remove(pos);
        }
    }
}

impl Default for ImportManager {
    fn default() -> Self {
        ImportManager {
            cache: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(Vec::new()),
        }
    }
}

/// Binds the names requested by `{% from "x" import a, b as c %}` into
/// `target`. `None` names means `import *`: every binding in the module.
pub fn bind_from_import(
    module: &Module,
    names: &Option<Vec<(String, Option<String>)>>,
    target: &Arc<Scope>,
    source_template: &str,
) -> Result<(), Error> {
    match names {
        None => {
            for (k, v) in &module.bindings {
                if !k.starts_with('_') {
                    target.set_export(k, v.clone());
                }
            }
        }
        Some(names) => {
            for (name, alias) in names {
                let value = module.get(name).ok_or_else(|| {
                    Error::new(
                        ErrorKind::ImportError,
                        format!(
                            "cannot import `{name}` from `{source_template}`: no such macro or export"
                        ),
                    )
                })?;
                target.set_export(alias.as_deref().unwrap_or(name), value);
            }
        }
    }
    Ok(())
}
