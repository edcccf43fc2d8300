//! Wires the built-in filter/test/global registries and the default
//! autoescape policy into a freshly constructed `Environment` (§6).

use crate::environment::Environment;
use crate::utils::AutoEscape;

/// Escapes `.html`/`.htm`/`.xml` template names, matching minijinja's
/// conventional default (§4.1 `set-autoescape` default policy).
pub fn default_auto_escape_callback(name: &str) -> AutoEscape {
    match name.rsplit('.').next() {
        Some("html") | Some("htm") | Some("xml") => AutoEscape::Html,
        _ => AutoEscape::None,
    }
}

pub fn register_builtins(env: &Environment) {
    crate::filters::register(env);
    crate::tests::register(env);
    crate::functions::register(env);
}
