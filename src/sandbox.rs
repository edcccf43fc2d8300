//! Sandboxed execution (§8 `SecurityPolicy`, `SecurityContext`).
//!
//! The sandbox gates three things the evaluator would otherwise do freely:
//! attribute/method access on host-supplied values, calling host functions,
//! and resource consumption (string size, loop iterations, recursion
//! depth). Every gate records to an audit log so a blocked render can be
//! explained after the fact.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use regex::Regex;

use crate::error::{Error, ErrorKind};

/// A single audited decision.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: String,
    pub subject: String,
    pub allowed: bool,
}

/// Per-render resource ceilings (§8 resource meters).
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_string_length: Option<usize>,
    pub max_iterations: Option<u64>,
    pub max_recursion_depth: Option<usize>,
    pub max_render_time_ms: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> ResourceLimits {
        ResourceLimits {
            max_string_length: Some(1 << 20),
            max_iterations: Some(1_000_000),
            max_recursion_depth: Some(100),
            max_render_time_ms: None,
        }
    }
}

/// A named, ordered attribute/method access rule. `pattern` is matched
/// against `type.attr` (e.g. `dict.update`); `allow` decides the outcome for
/// a match. The first matching rule wins; if nothing matches, `default`
/// governs.
pub struct AttributeRule {
    pub pattern: Regex,
    pub allow: bool,
}

/// An allow/deny list for one namespace of names (filters, tests, globals,
/// template-name patterns) with a whitelist/blacklist mode flag (§3
/// `SecurityPolicy`: "Filter allow/deny lists with whitelist-mode flag").
#[derive(Debug, Clone, Default)]
pub struct NameList {
    pub whitelist_mode: bool,
    pub names: Vec<String>,
}

impl NameList {
    pub fn whitelist(names: impl IntoIterator<Item = impl Into<String>>) -> NameList {
        NameList { whitelist_mode: true, names: names.into_iter().map(Into::into).collect() }
    }

    pub fn blacklist(names: impl IntoIterator<Item = impl Into<String>>) -> NameList {
        NameList { whitelist_mode: false, names: names.into_iter().map(Into::into).collect() }
    }

    fn allows(&self, name: &str) -> bool {
        let listed = self.names.iter().any(|n| n == name);
        if self.whitelist_mode {
            listed
        } else {
            !listed
        }
    }
}

/// The configured policy for one environment (§8 `SecurityPolicy`). Built
/// once and shared across renders via `Arc`.
pub struct SecurityPolicy {
    pub attribute_rules: Vec<AttributeRule>,
    pub default_attribute_allow: bool,
    pub allowed_functions: Option<Vec<String>>,
    pub blocked_functions: Vec<String>,
    pub limits: ResourceLimits,
    /// Filter/test/global/template-name allow-or-deny lists, each
    /// independently whitelist- or blacklist-moded (§3).
    pub filters: NameList,
    pub tests: NameList,
    pub globals: NameList,
    pub template_names: NameList,
    /// Deny-all switch for method calls regardless of name (§8 "the
    /// method's own name (or a generic deny-all switch)").
    pub deny_all_methods: bool,
    pub allowed_methods: Vec<String>,
    /// When `true` (the default), a gate denial aborts the render with a
    /// `security-violation`; when `false`, the operation proceeds after the
    /// violation is recorded (§3 "block-on-violation" flag).
    pub block_on_violation: bool,
    /// When `true`, allowed operations are appended to the audit log too,
    /// not just denials (§8 "Audit log").
    pub log_allowed_operations: bool,
    pub max_output_bytes: Option<u64>,
    pub max_input_length: Option<usize>,
    /// Re-escapes output the environment's own autoescape mode left alone
    /// (e.g. rendering with autoescape off) unless it's markup-tagged (§3
    /// "auto-escape-output" behavior flag).
    pub auto_escape_output: bool,
    /// Patterns checked against each written chunk; a match is a violation
    /// and, when blocking, the chunk is replaced with the empty string
    /// rather than aborting the render (§3 "restricted-content regexes").
    pub content_regexes: Vec<Regex>,
}

impl Default for SecurityPolicy {
    fn default() -> SecurityPolicy {
        SecurityPolicy {
            attribute_rules: default_attribute_rules(),
            default_attribute_allow: true,
            allowed_functions: None,
            blocked_functions: vec!["self".into(), "__class__".into(), "__globals__".into()],
            limits: ResourceLimits::default(),
            filters: NameList::default(),
            tests: NameList::default(),
            globals: NameList::default(),
            template_names: NameList::default(),
            deny_all_methods: false,
            allowed_methods: Vec::new(),
            block_on_violation: true,
            log_allowed_operations: false,
            max_output_bytes: None,
            max_input_length: None,
            auto_escape_output: false,
            content_regexes: Vec::new(),
        }
    }
}


fn default_attribute_rules() -> Vec<AttributeRule> {
    // Blocks dunder/private attribute traversal, the classic sandbox escape
    // vector (§8 open question 1 resolved against allowing it).
    vec![AttributeRule {
        pattern: Regex::new(r"^__").unwrap(),
        allow: false,
    }]
}

impl SecurityPolicy {
    pub fn check_attribute(&self, type_name: &str, attr: &str) -> bool {
        if attr.starts_with('_') {
            for rule in &self.attribute_rules {
                if rule.pattern.is_match(attr) {
                    return rule.allow;
                }
            }
            return false;
        }
        let combined = format!("{type_name}.{attr}");
        for rule in &self.attribute_rules {
            if rule.pattern.is_match(&combined) || rule.pattern.is_match(attr) {
                return rule.allow;
            }
        }
        self.default_attribute_allow
    }

    pub fn check_function(&self, name: &str) -> bool {
        if self.blocked_functions.iter().any(|b| b == name) {
            return false;
        }
        match &self.allowed_functions {
            Some(allowed) => allowed.iter().any(|a| a == name),
            None => true,
        }
    }
}

/// Lifecycle state for one render under a [`SecurityPolicy`] (§8 state
/// machine: created -> armed -> running -> {completed | blocked |
/// timed-out}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Armed,
    Running,
    Completed,
    Blocked,
    TimedOut,
}

/// Per-render sandbox instance: the policy plus live counters and the audit
/// log accumulated during this specific render.
pub struct SecurityContext {
    policy: std::sync::Arc<SecurityPolicy>,
    state: Mutex<SandboxState>,
    audit_log: Mutex<Vec<AuditEntry>>,
    iterations: AtomicU64,
    recursion_depth: AtomicUsize,
    output_bytes: AtomicU64,
    started_at: Mutex<Option<std::time::Instant>>,
}

impl SecurityContext {
    pub fn new(policy: std::sync::Arc<SecurityPolicy>) -> SecurityContext {
        SecurityContext {
            policy,
            state: Mutex::new(SandboxState::Created),
            audit_log: Mutex::new(Vec::new()),
            iterations: AtomicU64::new(0),
            recursion_depth: AtomicUsize::new(0),
            output_bytes: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// `max-output-bytes` (§3 limits), consulted on every write (§4.8
    /// "Cumulative output bytes").
    pub fn tick_output(&self, bytes: usize) -> Result<(), Error> {
        let total = self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        if let Some(max) = self.policy.max_output_bytes {
            if total > max {
                self.block();
                return Err(Error::new(
                    ErrorKind::SecurityViolation,
                    format!("render exceeded the configured output limit of {max} bytes"),
                ));
            }
        }
        Ok(())
    }

    pub fn arm(&self) {
        *self.state.lock().unwrap() = SandboxState::Armed;
    }

    pub fn begin_render(&self) {
        *self.state.lock().unwrap() = SandboxState::Running;
        *self.started_at.lock().unwrap() = Some(std::time::Instant::now());
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap()
    }

    pub fn audit(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().unwrap().clone()
    }

    fn record(&self, action: &str, subject: &str, allowed: bool) {
        if allowed && !self.policy.log_allowed_operations {
            return;
        }
        self.audit_log.lock().unwrap().push(AuditEntry {
            action: action.to_string(),
            subject: subject.to_string(),
            allowed,
        });
    }

    fn block(&self) {
        *self.state.lock().unwrap() = SandboxState::Blocked;
    }

    /// Applies a gate's allow/deny decision: records it, and — only when
    /// `block-on-violation` is set (the default) — turns a denial into a
    /// `security-violation` error. With the flag cleared, a denied
    /// operation is still recorded but the caller proceeds (§3
    /// "behavior flags (block-on-violation, ...)").
    fn gate(&self, action: &str, subject: &str, allowed: bool, message: impl FnOnce() -> String) -> Result<(), Error> {
        self.record(action, subject, allowed);
        if allowed {
            return Ok(());
        }
        if self.policy.block_on_violation {
            self.block();
            Err(Error::new(ErrorKind::SecurityViolation, message()))
        } else {
            Ok(())
        }
    }

    pub fn check_attribute(&self, type_name: &str, attr: &str) -> Result<(), Error> {
        let allowed = self.policy.check_attribute(type_name, attr);
        self.gate("attribute", &format!("{type_name}.{attr}"), allowed, || {
            format!("access to attribute `{attr}` on `{type_name}` is blocked")
        })
    }

    pub fn check_function(&self, name: &str) -> Result<(), Error> {
        let allowed = self.policy.check_function(name);
        self.gate("call", name, allowed, || format!("call to function `{name}` is blocked"))
    }

    pub fn check_filter(&self, name: &str) -> Result<(), Error> {
        let allowed = self.policy.filters.allows(name);
        self.gate("filter_access", name, allowed, || format!("filter `{name}` is not permitted by the sandbox policy"))
    }

    pub fn check_test(&self, name: &str) -> Result<(), Error> {
        let allowed = self.policy.tests.allows(name);
        self.gate("test_access", name, allowed, || format!("test `{name}` is not permitted by the sandbox policy"))
    }

    pub fn check_global(&self, name: &str) -> Result<(), Error> {
        let allowed = self.policy.globals.allows(name);
        self.gate("global_access", name, allowed, || format!("global `{name}` is not permitted by the sandbox policy"))
    }

    pub fn check_template_name(&self, name: &str) -> Result<(), Error> {
        let allowed = self.policy.template_names.allows(name);
        self.gate("template_access", name, allowed, || format!("template `{name}` is not permitted by the sandbox policy"))
    }

    pub fn check_method(&self, name: &str) -> Result<(), Error> {
        let allowed = if self.policy.deny_all_methods {
            self.policy.allowed_methods.iter().any(|m| m == name)
        } else {
            true
        };
        self.gate("method_call", name, allowed, || format!("method `{name}` is not permitted by the sandbox policy"))
    }

    /// `max-input-length` (§3 limits): validates arbitrary string-typed
    /// input routed through the evaluator (e.g. a literal handed to a
    /// filter) before it's used.
    pub fn check_input_length(&self, s: &str) -> Result<(), Error> {
        if let Some(max) = self.policy.max_input_length {
            if s.len() > max {
                return self.gate("input_validation", "input", false, || {
                    format!("input of length {} exceeds the configured limit of {max}", s.len())
                });
            }
        }
        Ok(())
    }

    /// Output sanitization (§4.8): applies `auto-escape-output` (when the
    /// value wasn't already markup-safe) and then the restricted-content
    /// regexes, to the chunk about to be written. A regex match is audited;
    /// under `block-on-violation` the chunk is dropped rather than the
    /// render aborted, since the write already happened logically once the
    /// template decided to emit it.
    pub fn sanitize_chunk(&self, safe: bool, chunk: String) -> String {
        let chunk = if self.policy.auto_escape_output && !safe {
            let mut escaped = String::with_capacity(chunk.len());
            let _ = crate::utils::html_escape(&mut escaped, &chunk);
            escaped
        } else {
            chunk
        };
        if self.policy.content_regexes.iter().any(|re| re.is_match(&chunk)) {
            self.record("content_restriction", "output", false);
            if self.policy.block_on_violation {
                return String::new();
            }
        }
        chunk
    }

    pub fn tick_iteration(&self) -> Result<(), Error> {
        let n = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.policy.limits.max_iterations {
            if n > max {
                self.block();
                return Err(Error::new(
                    ErrorKind::SecurityViolation,
                    format!("loop exceeded the configured limit of {max} iterations"),
                ));
            }
        }
        Ok(())
    }

    pub fn enter_recursion(&self) -> Result<(), Error> {
        let depth = self.recursion_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.policy.limits.max_recursion_depth {
            if depth > max {
                self.block();
                return Err(Error::new(
                    ErrorKind::SecurityViolation,
                    format!("recursion exceeded the configured limit of {max}"),
                ));
            }
        }
        Ok(())
    }

    pub fn exit_recursion(&self) {
        self.recursion_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn check_string_length(&self, len: usize) -> Result<(), Error> {
        if let Some(max) = self.policy.limits.max_string_length {
            if len > max {
                self.block();
                return Err(Error::new(
                    ErrorKind::SecurityViolation,
                    format!("string of length {len} exceeds the configured limit of {max}"),
                ));
            }
        }
        Ok(())
    }

    pub fn check_deadline(&self) -> Result<(), Error> {
        if let Some(max_ms) = self.policy.limits.max_render_time_ms {
            if let Some(started) = *self.started_at.lock().unwrap() {
                if started.elapsed().as_millis() as u64 > max_ms {
                    *self.state.lock().unwrap() = SandboxState::TimedOut;
                    return Err(Error::new(
                        ErrorKind::SecurityViolation,
                        format!("render exceeded the configured time limit of {max_ms}ms"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SandboxState::Running {
            *state = SandboxState::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dunder_attribute_blocked_by_default() {
        let policy = SecurityPolicy::default();
        assert!(!policy.check_attribute("dict", "__class__"));
        assert!(policy.check_attribute("dict", "items"));
    }

    #[test]
    fn iteration_limit_trips() {
        let ctx = SecurityContext::new(std::sync::Arc::new(SecurityPolicy {
            limits: ResourceLimits {
                max_iterations: Some(2),
                ..ResourceLimits::default()
            },
            ..SecurityPolicy::default()
        }));
        assert!(ctx.tick_iteration().is_ok());
        assert!(ctx.tick_iteration().is_ok());
        assert!(ctx.tick_iteration().is_err());
        assert_eq!(ctx.state(), SandboxState::Blocked);
    }

    #[test]
    fn blocked_function_is_audited() {
        let ctx = SecurityContext::new(std::sync::Arc::new(SecurityPolicy::default()));
        assert!(ctx.check_function("__globals__").is_err());
        let log = ctx.audit();
        assert_eq!(log.len(), 1);
        assert!(!log[0].allowed);
    }
}
