//! Per-render state (§3 `Context`, `LoopRecord`).
//!
//! A `Context` is created per render and discarded at the end of it; it is
//! single-threaded (§3 invariant) so every field here is owned, not shared
//! across renders. The output writer is threaded through evaluator calls
//! separately (see `eval::State`) rather than stored here, so that mutable
//! borrows of the scope chain and of the writer don't have to alias.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::Body;
use crate::error::Error;
use crate::import::ImportManager;
use crate::inheritance::BlockLevel;
use crate::sandbox::SecurityContext;
use crate::scope::Scope;
use crate::utils::AutoEscape;
use crate::value::{LoopRecordState, MacroValue, Value};

pub struct LoopFrame {
    pub state: Arc<LoopRecordState>,
    pub items: Arc<Vec<Value>>,
}

impl LoopFrame {
    pub fn previtem(&self) -> Value {
        let idx = self.state.index0;
        if idx == 0 {
            Value::undefined("loop.previtem", crate::value::UndefinedKind::Strict)
        } else {
            self.items[idx - 1].clone()
        }
    }

    pub fn nextitem(&self) -> Value {
        let idx = self.state.index0;
        if idx + 1 >= self.items.len() {
            Value::undefined("loop.nextitem", crate::value::UndefinedKind::Strict)
        } else {
            self.items[idx + 1].clone()
        }
    }
}

/// A `caller()` record: the anonymous macro implicitly passed to a macro
/// invoked from inside a `{% call %}` block.
pub struct CallerRecord {
    pub params: Vec<String>,
    pub defaults: Vec<Option<Value>>,
    pub body: Arc<Body>,
    pub scope: Arc<Scope>,
    pub template: Arc<str>,
}

pub struct Context {
    pub scope: Arc<Scope>,
    pub loop_stack: Vec<LoopFrame>,
    pub macro_stack: Vec<Arc<MacroValue>>,
    pub caller_stack: Vec<Arc<CallerRecord>>,
    pub errors: Vec<Error>,
    pub autoescape: AutoEscape,
    pub imports: Arc<ImportManager>,
    pub security: Option<Arc<SecurityContext>>,
    pub recursion_depth: usize,
    pub template_name: Arc<str>,
    /// Block name -> ordered overrides, most-derived first, for the
    /// `extends` chain currently being rendered (§4.5).
    pub block_table: HashMap<String, Vec<BlockLevel>>,
    /// Stack of (levels, index) pairs so `{{ super() }}` inside a block
    /// override can step to the next-less-derived level.
    pub block_cursor: Vec<(Vec<BlockLevel>, usize)>,
    /// Stack of (target, body, depth0) for `{% for ... recursive %}` loops,
    /// so `loop(children)` inside the body can re-enter it (§4.6).
    pub recursive_loop_stack: Vec<(crate::ast::AssignTarget, Arc<Body>, usize)>,
}

impl Context {
    pub fn new(
        scope: Arc<Scope>,
        autoescape: AutoEscape,
        imports: Arc<ImportManager>,
        security: Option<Arc<SecurityContext>>,
        template_name: Arc<str>,
    ) -> Context {
        Context {
            scope,
            loop_stack: Vec::new(),
            macro_stack: Vec::new(),
            caller_stack: Vec::new(),
            errors: Vec::new(),
            autoescape,
            imports,
            security,
            recursion_depth: 0,
            template_name,
            block_table: HashMap::new(),
            block_cursor: Vec::new(),
            recursive_loop_stack: Vec::new(),
        }
    }

    pub fn push_scope(&mut self) {
        self.scope = Scope::child(&self.scope);
    }

    pub fn pop_scope(&mut self) {
        if let Some(parent) = self.scope.parent.clone() {
            self.scope = parent;
        }
    }

    pub fn with_scope(&mut self, scope: Arc<Scope>) -> Arc<Scope> {
        std::mem::replace(&mut self.scope, scope)
    }

    pub fn current_loop(&self) -> Option<&LoopFrame> {
        self.loop_stack.last()
    }

    pub fn record_error(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// The canonical recovery point (§7): return the first accumulated
    /// non-fatal error if the render otherwise succeeded.
    pub fn take_pending_error(&mut self) -> Option<Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.remove(0))
        }
    }
}
