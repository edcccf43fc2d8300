//! Small shared helpers: autoescape mode, HTML escaping, whitespace control.

use std::fmt::Write;

use crate::value::Value;

/// The resolved auto-escape mode for a render (§4.1 `set-autoescape`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoEscape {
    None,
    Html,
    #[cfg(feature = "json")]
    Json,
}

/// A byte-level HTML escape routine (§1 treats this as an external
/// collaborator; a minimal faithful implementation is assumed).
pub fn html_escape(out: &mut dyn Write, s: &str) -> std::fmt::Result {
    for c in s.chars() {
        match c {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            '"' => out.write_str("&quot;")?,
            '\'' => out.write_str("&#x27;")?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}

/// Writes `value` to `out`, honoring `mode` unless the value is already
/// markup-tagged (§8 invariant 2: escaping a markup-tagged value is a no-op).
pub fn write_escaped(out: &mut dyn Write, mode: AutoEscape, value: &Value) -> std::fmt::Result {
    if value.is_safe() {
        return write!(out, "{value}");
    }
    match mode {
        AutoEscape::None => write!(out, "{value}"),
        AutoEscape::Html => html_escape(out, &value.to_string()),
        #[cfg(feature = "json")]
        AutoEscape::Json => {
            let s = serde_json::to_string(value).unwrap_or_default();
            out.write_str(&s)
        }
    }
}

/// Collapses runs of whitespace to a single space and trims the ends; used
/// by `{% trans trimmed %}` (§4.6).
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = true;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Strips the trailing newline sequence per `keep_trailing_newline=false`.
pub fn strip_trailing_newline(s: &str) -> &str {
    if let Some(stripped) = s.strip_suffix("\r\n") {
        stripped
    } else if let Some(stripped) = s.strip_suffix('\n') {
        stripped
    } else {
        s
    }
}
