//! A sandboxed, server-side Jinja2-dialect template engine.
//!
//! ```
//! use jinja_engine::Environment;
//!
//! let env = Environment::new();
//! let rendered = env.render_str("Hello, {{ name }}!", serde_json::json!({"name": "world"})).unwrap();
//! assert_eq!(rendered, "Hello, world!");
//! ```

mod ast;
mod cache;
mod context;
mod defaults;
mod environment;
mod error;
mod eval;
mod filters;
mod functions;
mod import;
mod inheritance;
mod lexer;
mod loader;
mod output;
mod parser;
mod sandbox;
mod scope;
mod template;
mod tests;
mod utils;
mod value;

pub use environment::{Environment, Settings};
pub use error::{Error, ErrorKind};
pub use loader::{FileSystemLoader, LoadedSource, Loader, MapLoader};
pub use sandbox::{AttributeRule, AuditEntry, ResourceLimits, SandboxState, SecurityPolicy};
pub use template::Template;
pub use utils::AutoEscape;
pub use value::{to_value, Key, Kwargs, UndefinedKind, Value};

#[cfg(test)]
mod tests_integration {
    use super::*;

    #[test]
    fn renders_plain_text() {
        let env = Environment::new();
        assert_eq!(env.render_str("hello world", ()).unwrap(), "hello world");
    }

    #[test]
    fn renders_variable_and_filter() {
        let env = Environment::new();
        let out = env.render_str("{{ name | upper }}", serde_json::json!({"name": "ada"})).unwrap();
        assert_eq!(out, "ADA");
    }

    #[test]
    fn if_else_branches() {
        let env = Environment::new();
        let out = env
            .render_str("{% if n is odd %}odd{% else %}even{% endif %}", serde_json::json!({"n": 3}))
            .unwrap();
        assert_eq!(out, "odd");
    }

    #[test]
    fn for_loop_with_loop_record() {
        let env = Environment::new();
        let out = env
            .render_str(
                "{% for x in items %}{{ loop.index }}:{{ x }} {% endfor %}",
                serde_json::json!({"items": ["a", "b"]}),
            )
            .unwrap();
        assert_eq!(out, "1:a 2:b ");
    }

    #[test]
    fn undefined_renders_as_empty_by_default() {
        let env = Environment::new();
        let out = env.render_str("[{{ missing }}]", serde_json::json!({})).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn macro_definition_and_call() {
        let env = Environment::new();
        let out = env
            .render_str("{% macro greet(name) %}Hi {{ name }}{% endmacro %}{{ greet('Sam') }}", serde_json::json!({}))
            .unwrap();
        assert_eq!(out, "Hi Sam");
    }

    #[test]
    fn inheritance_block_override() {
        let env = Environment::new();
        env.add_template("base.txt", "before{% block body %}base{% endblock %}after").unwrap();
        env.add_template("child.txt", "{% extends 'base.txt' %}{% block body %}child{% endblock %}").unwrap();
        let tmpl = env.get_template("child.txt").unwrap();
        assert_eq!(tmpl.render(serde_json::json!({})).unwrap(), "beforechildafter");
    }

    #[test]
    fn inheritance_super_call() {
        let env = Environment::new();
        env.add_template("base.txt", "{% block body %}base{% endblock %}").unwrap();
        env.add_template("child.txt", "{% extends 'base.txt' %}{% block body %}{{ super() }}+child{% endblock %}").unwrap();
        let tmpl = env.get_template("child.txt").unwrap();
        assert_eq!(tmpl.render(serde_json::json!({})).unwrap(), "base+child");
    }
}
