//! A bound, renderable template handle (§3/§6).

use std::sync::Arc;

use crate::ast::{Ast, Stmt};
use crate::cache::CompiledTemplate;
use crate::context::Context;
use crate::environment::Environment;
use crate::error::Error;
use crate::eval;
use crate::import::{ImportManager, Module};
use crate::output::Output;
use crate::sandbox::SecurityContext;
use crate::scope::Scope;
use crate::value::to_value;

#[derive(Clone)]
pub struct Template {
    env: Environment,
    compiled: Arc<CompiledTemplate>,
}

impl Template {
    pub(crate) fn new(env: Environment, compiled: Arc<CompiledTemplate>) -> Template {
        Template { env, compiled }
    }

    pub fn name(&self) -> &str {
        &self.compiled.name
    }

    pub fn source(&self) -> &str {
        &self.compiled.source
    }

    /// The parsed AST, for introspection (§6 `ast()`).
    pub fn ast(&self) -> &Ast {
        &self.compiled.ast
    }

    /// Every block name reachable in this template's `extends` chain (§6
    /// `block-names()`).
    pub fn block_names(&self) -> Result<Vec<String>, Error> {
        let mut state = self.fresh_state();
        crate::inheritance::block_names(&mut state, &self.compiled)
    }

    /// Every macro defined at this template's top level (§6 `macro-names()`).
    /// Macros are not collected across `extends`/`include` boundaries: each
    /// template only reports what it itself defines.
    pub fn macro_names(&self) -> Vec<String> {
        self.compiled
            .ast
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::Macro(def) => Some(def.name.clone()),
                _ => None,
            })
            .collect()
    }

    fn fresh_state(&self) -> eval::State {
        let scope = Scope::root();
        let autoescape = self.env.0.autoescape_for(&self.compiled.name);
        let context = Context::new(scope, autoescape, ImportManager::new(), None, self.compiled.name.clone());
        eval::State { env: self.env.0.clone(), ctx: context, out: Output::new() }
    }

    /// Renders the template against `ctx`, which is serialized into the
    /// root scope (§6).
    pub fn render<S: serde::Serialize>(&self, ctx: S) -> Result<String, Error> {
        let root_value = to_value(ctx)?;
        let scope = Scope::root();
        if let crate::value::Value::Map(map) = &root_value {
            for (k, v) in map.iter() {
                scope.set(&k.to_string(), v.clone());
            }
        }
        let autoescape = self.env.0.autoescape_for(&self.compiled.name);
        let security = self
            .env
            .0
            .security_policy()
            .map(|policy| Arc::new(SecurityContext::new(policy)));
        if let Some(sec) = &security {
            sec.arm();
            sec.begin_render();
        }
        let context = Context::new(scope, autoescape, ImportManager::new(), security.clone(), self.compiled.name.clone());
        let mut state = eval::State {
            env: self.env.0.clone(),
            ctx: context,
            out: Output::new(),
        };
        eval::render_template(&mut state, &self.compiled)?;
        if let Some(sec) = &security {
            sec.finish();
        }
        if let Some(err) = state.ctx.take_pending_error() {
            return Err(err);
        }
        let rendered = state.out.into_string();
        if self.env.0.settings().keep_trailing_newline {
            Ok(rendered)
        } else {
            Ok(crate::utils::strip_trailing_newline(&rendered).to_string())
        }
    }

    /// Renders into an existing `std::fmt::Write` sink instead of building
    /// a `String` (§6, avoids the extra allocation for large templates).
    pub fn render_to_write<S: serde::Serialize, W: std::fmt::Write>(&self, ctx: S, writer: &mut W) -> Result<(), Error> {
        let rendered = self.render(ctx)?;
        writer.write_str(&rendered).map_err(Error::from)
    }

    fn root_scope_for<S: serde::Serialize>(&self, ctx: S) -> Result<Arc<Scope>, Error> {
        let root_value = to_value(ctx)?;
        let scope = Scope::root();
        if let crate::value::Value::Map(map) = &root_value {
            for (k, v) in map.iter() {
                scope.set(&k.to_string(), v.clone());
            }
        }
        Ok(scope)
    }

    /// `render-block(name, vars, writer)` (§6): renders a single named
    /// block from this template's `extends` chain, with `super()` and block
    /// scoping working exactly as during a full render.
    pub fn render_block_to_string<S: serde::Serialize>(&self, name: &str, ctx: S) -> Result<String, Error> {
        let scope = self.root_scope_for(ctx)?;
        let autoescape = self.env.0.autoescape_for(&self.compiled.name);
        let context = Context::new(scope, autoescape, ImportManager::new(), None, self.compiled.name.clone());
        let mut state = eval::State { env: self.env.0.clone(), ctx: context, out: Output::new() };
        eval::render_named_block(&mut state, &self.compiled, name)?;
        if let Some(err) = state.ctx.take_pending_error() {
            return Err(err);
        }
        Ok(state.out.into_string())
    }

    pub fn render_block<S: serde::Serialize, W: std::fmt::Write>(&self, name: &str, ctx: S, writer: &mut W) -> Result<(), Error> {
        let rendered = self.render_block_to_string(name, ctx)?;
        writer.write_str(&rendered).map_err(Error::from)
    }

    /// `make-module(vars)` (§6): executes this template in module mode,
    /// exposing its top-level macros and explicit exports (§4.7).
    pub fn make_module<S: serde::Serialize>(&self, ctx: S) -> Result<Arc<Module>, Error> {
        let scope = self.root_scope_for(ctx)?;
        let autoescape = self.env.0.autoescape_for(&self.compiled.name);
        let context = Context::new(scope, autoescape, ImportManager::new(), None, self.compiled.name.clone());
        let mut state = eval::State { env: self.env.0.clone(), ctx: context, out: Output::new() };
        eval::make_module(&mut state, &self.compiled)
    }

    /// `make-module-with-context(context, vars)` (§6, §9): like
    /// `make_module`, but the module body executes in a child of `context`'s
    /// current scope, so it can see the caller's locals. The passed-in
    /// context's scope is restored afterward even if rendering fails (§9
    /// "treat the save/restore as transactional").
    pub fn make_module_with_context<S: serde::Serialize>(
        &self,
        caller_state: &mut eval::State,
        ctx: S,
    ) -> Result<Arc<Module>, Error> {
        let root_value = to_value(ctx)?;
        let child_scope = Scope::child(&caller_state.ctx.scope);
        if let crate::value::Value::Map(map) = &root_value {
            for (k, v) in map.iter() {
                child_scope.set(&k.to_string(), v.clone());
            }
        }
        let prev_scope = caller_state.ctx.with_scope(child_scope);
        let prev_name = caller_state.ctx.template_name.clone();
        caller_state.ctx.template_name = self.compiled.name.clone();
        let result = eval::make_module(caller_state, &self.compiled);
        caller_state.ctx.template_name = prev_name;
        caller_state.ctx.scope = prev_scope;
        result
    }
}
