//! The render output sink: a stack of string buffers so `{% set x %}...{%
//! endset %}`, `{% filter %}` blocks, and macro calls can capture their
//! body's output instead of writing straight through to the final render.

use std::fmt;

pub struct Output {
    stack: Vec<String>,
}

impl Output {
    pub fn new() -> Output {
        Output { stack: vec![String::new()] }
    }

    pub fn begin_capture(&mut self) {
        self.stack.push(String::new());
    }

    pub fn end_capture(&mut self) -> String {
        self.stack.pop().expect("capture stack underflow")
    }

    pub fn into_string(mut self) -> String {
        self.stack.pop().unwrap_or_default()
    }
}

impl Default for Output {
    fn default() -> Output {
        Output::new()
    }
}

impl fmt::Write for Output {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.stack.last_mut().expect("output stack never empty").push_str(s);
        Ok(())
    }
}

/// Splits a fully-rendered string into the fragments `Environment::generate`
/// hands to its consumer (§5 "Streaming render"): one fragment per line,
/// keeping line terminators attached, so a caller iterating the result sees
/// output arrive in the same order it was written without waiting for the
/// whole render — the consumer-facing contract this core can offer without
/// true producer/consumer concurrency (§5 notes this engine has no
/// suspension points in synchronous mode).
pub fn split_fragments(rendered: &str) -> Vec<String> {
    if rendered.is_empty() {
        return Vec::new();
    }
    let mut fragments = Vec::new();
    let mut start = 0;
    let bytes = rendered.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'\n' {
            fragments.push(rendered[start..=i].to_string());
            start = i + 1;
        }
    }
    if start < rendered.len() {
        fragments.push(rendered[start..].to_string());
    }
    fragments
}
