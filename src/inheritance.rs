//! `{% extends %}` / `{% block %}` resolution (§4).
//!
//! Rendering an inheriting template starts at the root of its `extends`
//! chain and walks down: each block renders the most-derived override that
//! exists for its name, and `{{ super() }}` steps one level less derived.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{Body, Stmt};
use crate::cache::CompiledTemplate;
use crate::error::{Error, ErrorKind};
use crate::eval::{eval_expr, State};

/// One level of a resolved block: which template defined this override and
/// its body.
#[derive(Clone)]
pub struct BlockLevel {
    pub template: Arc<str>,
    pub body: Arc<Body>,
    pub scoped: bool,
}

/// The result of following an `extends` chain: the root template to render
/// plus, for every block name seen anywhere in the chain, the ordered list
/// of overrides from most- to least-derived.
pub struct ResolvedChain {
    pub root: Arc<CompiledTemplate>,
    pub blocks: HashMap<String, Vec<BlockLevel>>,
}

/// Walks `leaf`'s `extends` chain, loading and compiling each ancestor via
/// `state`'s environment, and returns the combined block table (§4
/// invariant: multiple levels of inheritance compose).
pub fn resolve_chain(state: &mut State, leaf: Arc<CompiledTemplate>) -> Result<ResolvedChain, Error> {
    let mut chain = vec![leaf];
    let mut visited = vec![chain[0].name.clone()];
    loop {
        let current = chain.last().unwrap().clone();
        let extends_expr = current.ast.body.iter().find_map(|s| match s {
            Stmt::Extends(e) => Some((**e).clone()),
            _ => None,
        });
        let Some(expr) = extends_expr else { break };
        let parent_name_value = eval_expr(state, &expr)?;
        let parent_name = parent_name_value.as_str().ok_or_else(|| {
            Error::new(ErrorKind::TemplateError, "`extends` target must evaluate to a string")
        })?.to_string();
        if visited.iter().any(|n| n.as_ref() == parent_name) {
            return Err(Error::new(
                ErrorKind::TemplateError,
                format!("circular template inheritance detected at `{parent_name}`"),
            ));
        }
        if let Some(sec) = &state.ctx.security {
            sec.check_template_name(&parent_name)?;
        }
        let parent = state.env.load_compiled(&parent_name)?;
        visited.push(parent.name.clone());
        chain.push(parent);
    }

    let mut blocks: HashMap<String, Vec<BlockLevel>> = HashMap::new();
    for tmpl in &chain {
        for (name, level) in own_blocks(tmpl) {
            blocks.entry(name).or_default().push(level);
        }
    }

    let root = chain.pop().unwrap();
    Ok(ResolvedChain { root, blocks })
}

/// The block table for a single template considered on its own, with no
/// ancestors spliced in (used both by `resolve_chain` and by
/// `Template::render_block` on a non-inheriting template).
pub fn own_blocks(tmpl: &Arc<CompiledTemplate>) -> HashMap<String, BlockLevel> {
    let mut local = HashMap::new();
    collect_blocks(&tmpl.ast.body, &mut local);
    local
        .into_iter()
        .map(|(name, (body, scoped))| (name, BlockLevel { template: tmpl.name.clone(), body, scoped }))
        .collect()
}

/// All block names a template's `extends` chain defines (§6 `block-names`).
pub fn block_names(state: &mut State, compiled: &Arc<CompiledTemplate>) -> Result<Vec<String>, Error> {
    let has_extends = compiled.ast.body.iter().any(|s| matches!(s, Stmt::Extends(_)));
    if has_extends {
        Ok(resolve_chain(state, compiled.clone())?.blocks.into_keys().collect())
    } else {
        Ok(own_blocks(compiled).into_keys().collect())
    }
}

/// Strips leading/trailing whitespace-only raw-text nodes from a block
/// override's body (§4.5 step 5), so writing an override across several
/// source lines doesn't introduce stray blank lines around its content.
fn trim_block_body(body: &Body) -> Body {
    let mut trimmed = body.clone();
    while let Some(Stmt::EmitRaw(s)) = trimmed.first() {
        if s.trim().is_empty() {
            trimmed.remove(0);
        } else {
            break;
        }
    }
    while let Some(Stmt::EmitRaw(s)) = trimmed.last() {
        if s.trim().is_empty() {
            trimmed.pop();
        } else {
            break;
        }
    }
    trimmed
}

fn collect_blocks(body: &Body, out: &mut HashMap<String, (Arc<Body>, bool)>) {
    for stmt in body {
        match stmt {
            Stmt::Block(b) => {
                out.entry(b.name.clone()).or_insert_with(|| (Arc::new(trim_block_body(&b.body)), b.scoped));
                collect_blocks(&b.body, out);
            }
            Stmt::If(s) => {
                for (_, b) in &s.branches {
                    collect_blocks(b, out);
                }
                collect_blocks(&s.else_body, out);
            }
            Stmt::For(s) => {
                collect_blocks(&s.body, out);
                collect_blocks(&s.else_body, out);
            }
            Stmt::With(s) => collect_blocks(&s.body, out),
            Stmt::AutoEscape(s) => collect_blocks(&s.body, out),
            Stmt::FilterBlock(s) => collect_blocks(&s.body, out),
            _ => {}
        }
    }
}
