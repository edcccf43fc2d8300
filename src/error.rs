use std::borrow::Cow;
use std::fmt;

/// Represents a template error.
///
/// Every error produced by this crate carries a [`ErrorKind`], an optional
/// human readable detail message, and (when available) the template name and
/// line number the error happened at.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<Cow<'static, str>>,
    name: Option<String>,
    line: usize,
    attempted: Vec<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Error {}

/// The kind of a template [`Error`].
///
/// Matches the error taxonomy of the spec (§7): each §7 kind maps to exactly
/// one variant here, plus a handful of internal kinds the evaluator needs to
/// report arity mismatches and bad method dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// `template-syntax-error`
    TemplateSyntaxError,
    /// `template-error`
    TemplateError,
    /// `template-not-found`
    TemplateNotFound,
    /// `templates-not-found`
    TemplatesNotFound,
    /// `undefined-error`
    UndefinedError,
    /// `range-error`
    RangeError,
    /// `import-error`
    ImportError,
    /// `macro-error`
    MacroError,
    /// `security-violation`
    SecurityViolation,
    /// `i/o-error`
    IoError,
    /// bad operand types, unknown filter/test/method, etc.
    InvalidOperation,
    /// too many / too few / duplicate arguments to a call
    InvalidArguments,
    /// unknown filter name
    UnknownFilter,
    /// unknown test name
    UnknownTest,
    /// unknown attribute or method on a value
    UnknownMethod,
    /// value could not be serialized into the internal `Value` form
    BadSerialization,
    /// division by zero, out-of-range cast, etc.
    InvalidOperationArithmetic,
}

impl ErrorKind {
    fn description(self) -> &'static str {
        use ErrorKind::*;
        match self {
            TemplateSyntaxError => "template syntax error",
            TemplateError => "template error",
            TemplateNotFound => "template not found",
            TemplatesNotFound => "none of the requested templates were found",
            UndefinedError => "undefined value",
            RangeError => "index out of range",
            ImportError => "import error",
            MacroError => "macro error",
            SecurityViolation => "security violation",
            IoError => "i/o error",
            InvalidOperation => "invalid operation",
            InvalidArguments => "invalid arguments",
            UnknownFilter => "unknown filter",
            UnknownTest => "unknown test",
            UnknownMethod => "unknown method or attribute",
            BadSerialization => "could not serialize value",
            InvalidOperationArithmetic => "invalid arithmetic operation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref detail) = self.detail {
            write!(f, "{}: {}", self.kind, detail)?;
        } else {
            write!(f, "{}", self.kind)?;
        }
        if let Some(ref name) = self.name {
            write!(f, " (in {}:{})", name, self.line)?;
        }
        if !self.attempted.is_empty() {
            write!(f, " (tried: {})", self.attempted.join(", "))?;
        }
        Ok(())
    }
}

impl Error {
    /// Creates a new error with a kind and a detail message.
    pub fn new<D: Into<Cow<'static, str>>>(kind: ErrorKind, detail: D) -> Error {
        Error {
            kind,
            detail: Some(detail.into()),
            name: None,
            line: 0,
            attempted: Vec::new(),
            source: None,
        }
    }

    /// Creates a *templates-not-found* error aggregating every attempted name.
    pub fn not_found_many(attempted: Vec<String>) -> Error {
        Error {
            kind: ErrorKind::TemplatesNotFound,
            detail: Some("none of the requested templates could be loaded".into()),
            name: None,
            line: 0,
            attempted,
            source: None,
        }
    }

    pub(crate) fn set_location(&mut self, name: &str, line: usize) {
        if self.name.is_none() {
            self.name = Some(name.to_string());
            self.line = line;
        }
    }

    /// Attaches another error as the source of this one.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the detail message, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the template name this error occurred in, if known.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the line number this error occurred at, if known.
    pub fn line(&self) -> Option<usize> {
        self.name.as_ref().map(|_| self.line)
    }

    /// The list of template names attempted (for `templates-not-found`).
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            detail: None,
            name: None,
            line: 0,
            attempted: Vec::new(),
            source: None,
        }
    }
}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: fmt::Display,
    {
        Error::new(ErrorKind::BadSerialization, msg.to_string())
    }
}

impl From<fmt::Error> for Error {
    fn from(_: fmt::Error) -> Self {
        Error::new(ErrorKind::IoError, "failed to write template output")
    }
}

/// Shorthand used throughout the crate, mirroring the teacher's `ok!` macro:
/// propagate an error but tag it with the current template name/line first.
macro_rules! ok {
    ($expr:expr) => {
        match $expr {
            Ok(rv) => rv,
            Err(err) => return Err(err),
        }
    };
}

pub(crate) use ok;
