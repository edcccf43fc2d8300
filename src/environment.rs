//! The environment: registries, settings, and template lookup (§6).
//!
//! `Environment` is a cheap `Arc` handle; clone it freely to share one
//! configuration across threads. Mutating methods (`add_template`,
//! `add_filter`, ...) take `&self` and lock internally, so a shared
//! `Environment` can still be configured after templates have started
//! rendering from another thread — matching §6's "render-time mutation is
//! safe but not recommended" note.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cache::{CompiledTemplate, TemplateCache};
use crate::error::{Error, ErrorKind};
use crate::loader::Loader;
use crate::sandbox::SecurityPolicy;
use crate::template::Template;
use crate::utils::AutoEscape;
use crate::value::{to_value, NativeFunc, UndefinedKind, Value};

/// The `extensions=` component of the signature formula: the sorted,
/// comma-separated set of engine Cargo features built into this binary,
/// since each one changes what a template may legally use (e.g. a cached
/// artifact compiled with `sandbox` off must not be reused once it's on).
fn enabled_extensions() -> String {
    let mut names = Vec::new();
    if cfg!(feature = "builtins") {
        names.push("builtins");
    }
    if cfg!(feature = "multi_template") {
        names.push("multi_template");
    }
    if cfg!(feature = "macros") {
        names.push("macros");
    }
    if cfg!(feature = "sandbox") {
        names.push("sandbox");
    }
    if cfg!(feature = "json") {
        names.push("json");
    }
    if cfg!(feature = "urlencode") {
        names.push("urlencode");
    }
    names.sort_unstable();
    names.join(",")
}

/// An auto-escape decision callback: given a template name, returns the
/// escaping mode that should apply when no `{% autoescape %}` block
/// overrides it.
pub type AutoEscapeCallback = dyn Fn(&str) -> AutoEscape + Send + Sync;

/// `set-finalize` (§4.1): runs on every emitted expression before
/// autoescape; `None` leaves the value untouched.
pub type FinalizeCallback = dyn Fn(&Value) -> Option<Value> + Send + Sync;

/// `set-undefined-factory` (§4.1): produces the sentinel returned for a
/// missing name, keyed by the name that failed to resolve.
pub type UndefinedFactory = dyn Fn(&str) -> Value + Send + Sync;

/// `set-url-for` (§4.1): backs the `url_for()` global.
pub type UrlForCallback = dyn Fn(&[Value], &crate::value::Kwargs) -> Result<Value, Error> + Send + Sync;

/// `gettext`/`pgettext` hooks consulted by `{% trans %}` (§4.6).
pub type GettextFn = dyn Fn(&str) -> String + Send + Sync;
pub type PgettextFn = dyn Fn(&str, &str) -> String + Send + Sync;
pub type NgettextFn = dyn Fn(&str, &str, i64) -> String + Send + Sync;
pub type NpgettextFn = dyn Fn(&str, &str, &str, i64) -> String + Send + Sync;

/// The i18n hook set an environment plugs `{% trans %}` into. Defaults to
/// `None`, in which case `{% trans %}` falls back to rendering its own
/// singular/plural branch verbatim (no catalog lookup).
#[derive(Clone, Default)]
pub struct I18nHooks {
    pub gettext: Option<Arc<GettextFn>>,
    pub pgettext: Option<Arc<PgettextFn>>,
    pub ngettext: Option<Arc<NgettextFn>>,
    pub npgettext: Option<Arc<NpgettextFn>>,
}

/// Render-affecting knobs collected in one struct so they can be hashed
/// into a bytecode-cache signature together (§3, §6).
#[derive(Clone)]
pub struct Settings {
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
    pub auto_reload: bool,
    pub recursion_limit: usize,
    pub fuel: Option<u64>,
    pub undefined_kind: UndefinedKind,
    pub i18n_trimmed: bool,
    pub cache_size: usize,
    pub cache_ttl: Option<u64>,
    pub line_statement_prefix: Option<String>,
    pub line_comment_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
            auto_reload: true,
            recursion_limit: 100,
            fuel: None,
            undefined_kind: UndefinedKind::Debug,
            i18n_trimmed: false,
            cache_size: 400,
            cache_ttl: None,
            line_statement_prefix: None,
            line_comment_prefix: None,
        }
    }
}

pub struct EnvironmentInner {
    pub loader: RwLock<Option<Arc<dyn Loader>>>,
    pub cache: TemplateCache,
    pub filters: RwLock<HashMap<String, Arc<NativeFunc>>>,
    pub tests: RwLock<HashMap<String, Arc<NativeFunc>>>,
    pub globals: RwLock<HashMap<String, Value>>,
    pub settings: RwLock<Settings>,
    pub autoescape_callback: RwLock<Arc<AutoEscapeCallback>>,
    pub security_policy: RwLock<Option<Arc<SecurityPolicy>>>,
    pub finalize: RwLock<Option<Arc<FinalizeCallback>>>,
    pub undefined_factory: RwLock<Option<Arc<UndefinedFactory>>>,
    pub url_for: RwLock<Option<Arc<UrlForCallback>>>,
    pub i18n: RwLock<I18nHooks>,
    pub bytecode_cache: RwLock<Option<Arc<dyn crate::cache::BytecodeCache>>>,
}

/// A cheap, cloneable handle to a configured template environment.
#[derive(Clone)]
pub struct Environment(pub(crate) Arc<EnvironmentInner>);

impl Environment {
    pub fn new() -> Environment {
        let env = EnvironmentInner {
            loader: RwLock::new(None),
            cache: TemplateCache::new(),
            filters: RwLock::new(HashMap::new()),
            tests: RwLock::new(HashMap::new()),
            globals: RwLock::new(HashMap::new()),
            settings: RwLock::new(Settings::default()),
            autoescape_callback: RwLock::new(Arc::new(crate::defaults::default_auto_escape_callback)),
            security_policy: RwLock::new(None),
            finalize: RwLock::new(None),
            undefined_factory: RwLock::new(None),
            url_for: RwLock::new(None),
            i18n: RwLock::new(I18nHooks::default()),
            bytecode_cache: RwLock::new(None),
        };
        let environment = Environment(Arc::new(env));
        crate::defaults::register_builtins(&environment);
        environment
    }

    pub fn set_loader<L: Loader + 'static>(&self, loader: L) {
        *self.0.loader.write().unwrap() = Some(Arc::new(loader));
    }

    pub fn add_template(&self, name: &str, source: &str) -> Result<(), Error> {
        self.0.cache.insert_source(name, source)?;
        Ok(())
    }

    pub fn add_templates<I: IntoIterator<Item = (String, String)>>(&self, templates: I) -> Result<(), Error> {
        for (name, source) in templates {
            self.add_template(&name, &source)?;
        }
        Ok(())
    }

    pub fn remove_template(&self, name: &str) {
        self.0.cache.invalidate(name);
    }

    pub fn clear_templates(&self) {
        self.0.cache.clear();
    }

    pub fn add_filter<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut crate::eval::State, &[Value], &crate::value::Kwargs) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.0.filters.write().unwrap().insert(name.to_string(), Arc::new(f));
    }

    pub fn remove_filter(&self, name: &str) {
        self.0.filters.write().unwrap().remove(name);
    }

    pub fn add_test<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut crate::eval::State, &[Value], &crate::value::Kwargs) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.0.tests.write().unwrap().insert(name.to_string(), Arc::new(f));
    }

    pub fn remove_test(&self, name: &str) {
        self.0.tests.write().unwrap().remove(name);
    }

    pub fn add_global(&self, name: &str, value: impl Into<Value>) {
        self.0.globals.write().unwrap().insert(name.to_string(), value.into());
    }

    pub fn add_global_value<T: serde::Serialize>(&self, name: &str, value: T) -> Result<(), Error> {
        self.0.globals.write().unwrap().insert(name.to_string(), to_value(value)?);
        Ok(())
    }

    pub fn add_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut crate::eval::State, &[Value], &crate::value::Kwargs) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.0
            .globals
            .write()
            .unwrap()
            .insert(name.to_string(), Value::Callable(Arc::new(f), name.into()));
    }

    pub fn set_auto_escape_callback<F: Fn(&str) -> AutoEscape + Send + Sync + 'static>(&self, f: F) {
        *self.0.autoescape_callback.write().unwrap() = Arc::new(f);
    }

    pub fn set_security_policy(&self, policy: SecurityPolicy) {
        *self.0.security_policy.write().unwrap() = Some(Arc::new(policy));
    }

    pub fn clear_security_policy(&self) {
        *self.0.security_policy.write().unwrap() = None;
    }

    pub fn set_trim_blocks(&self, value: bool) {
        self.0.settings.write().unwrap().trim_blocks = value;
    }

    pub fn set_lstrip_blocks(&self, value: bool) {
        self.0.settings.write().unwrap().lstrip_blocks = value;
    }

    pub fn set_keep_trailing_newline(&self, value: bool) {
        self.0.settings.write().unwrap().keep_trailing_newline = value;
    }

    pub fn set_line_statement_prefix<S: Into<String>>(&self, value: Option<S>) {
        self.0.settings.write().unwrap().line_statement_prefix = value.map(Into::into);
    }

    pub fn set_line_comment_prefix<S: Into<String>>(&self, value: Option<S>) {
        self.0.settings.write().unwrap().line_comment_prefix = value.map(Into::into);
    }

    pub fn set_auto_reload(&self, value: bool) {
        self.0.settings.write().unwrap().auto_reload = value;
    }

    pub fn set_recursion_limit(&self, value: usize) {
        self.0.settings.write().unwrap().recursion_limit = value;
    }

    pub fn set_fuel(&self, value: Option<u64>) {
        self.0.settings.write().unwrap().fuel = value;
    }

    /// The undefined variant produced for a name that fails to resolve,
    /// absent a custom `set_undefined_factory` (§3 `Undefined`).
    pub fn set_undefined_kind(&self, kind: UndefinedKind) {
        self.0.settings.write().unwrap().undefined_kind = kind;
    }

    /// `ext.i18n.trimmed` policy default: collapses `{% trans %}` output to
    /// single spaces unless a block-local `trimmed`/`notrimmed` overrides it
    /// (§4.6).
    pub fn set_i18n_trimmed(&self, value: bool) {
        self.0.settings.write().unwrap().i18n_trimmed = value;
    }

    /// Maximum number of entries the template cache retains (§4.3).
    pub fn set_cache_size(&self, value: usize) {
        self.0.settings.write().unwrap().cache_size = value;
        self.0.cache.set_capacity(value);
    }

    /// Maximum age, in seconds, of a template-cache entry before it is
    /// treated as stale regardless of the loader's modification marker
    /// (§3 `CacheEntry`).
    pub fn set_cache_ttl(&self, value: Option<u64>) {
        self.0.settings.write().unwrap().cache_ttl = value;
        self.0.cache.set_ttl(value);
    }

    pub fn set_bytecode_cache<C: crate::cache::BytecodeCache + 'static>(&self, cache: C) {
        *self.0.bytecode_cache.write().unwrap() = Some(Arc::new(cache));
    }

    pub fn clear_bytecode_cache(&self) {
        if let Some(cache) = self.0.bytecode_cache.read().unwrap().as_ref() {
            cache.clear();
        }
    }

    /// `set-finalize` (§4.1): runs on every emitted expression value before
    /// autoescape.
    pub fn set_finalize<F>(&self, f: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        *self.0.finalize.write().unwrap() = Some(Arc::new(f));
    }

    /// `set-undefined-factory` (§4.1): overrides the sentinel produced for a
    /// name that fails to resolve (by default, a debug-strictness undefined
    /// named after the lookup).
    pub fn set_undefined_factory<F>(&self, f: F)
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        *self.0.undefined_factory.write().unwrap() = Some(Arc::new(f));
    }

    /// `set-url-for` (§4.1): backs the `url_for()` global exposed to
    /// templates.
    pub fn set_url_for<F>(&self, f: F)
    where
        F: Fn(&[Value], &crate::value::Kwargs) -> Result<Value, Error> + Send + Sync + 'static,
    {
        *self.0.url_for.write().unwrap() = Some(Arc::new(f));
    }

    /// Installs the `gettext`/`pgettext` hook consulted by `{% trans %}`
    /// with no plural branch.
    pub fn set_gettext<F: Fn(&str) -> String + Send + Sync + 'static>(&self, f: F) {
        self.0.i18n.write().unwrap().gettext = Some(Arc::new(f));
    }

    pub fn set_pgettext<F: Fn(&str, &str) -> String + Send + Sync + 'static>(&self, f: F) {
        self.0.i18n.write().unwrap().pgettext = Some(Arc::new(f));
    }

    /// Installs the `ngettext`/`npgettext` hook consulted by `{% trans %}`
    /// with a `{% pluralize %}` branch.
    pub fn set_ngettext<F: Fn(&str, &str, i64) -> String + Send + Sync + 'static>(&self, f: F) {
        self.0.i18n.write().unwrap().ngettext = Some(Arc::new(f));
    }

    pub fn set_npgettext<F: Fn(&str, &str, &str, i64) -> String + Send + Sync + 'static>(&self, f: F) {
        self.0.i18n.write().unwrap().npgettext = Some(Arc::new(f));
    }

    pub fn get_template(&self, name: &str) -> Result<Template, Error> {
        let compiled = self.0.load_compiled(name)?;
        Ok(Template::new(self.clone(), compiled))
    }

    /// `select(names)` (§4.1): returns the first template in `names` that
    /// loads successfully; if every name fails with `TemplateNotFound`,
    /// fails with an aggregating `TemplatesNotFound` instead.
    pub fn select_template(&self, names: &[&str]) -> Result<Template, Error> {
        let mut attempted = Vec::new();
        for name in names {
            match self.get_template(name) {
                Ok(tmpl) => return Ok(tmpl),
                Err(err) if err.kind() == ErrorKind::TemplateNotFound => attempted.push(name.to_string()),
                Err(err) => return Err(err),
            }
        }
        Err(Error::new(
            ErrorKind::TemplatesNotFound,
            format!("none of the following templates could be found: {}", attempted.join(", ")),
        ))
    }

    /// `get-or-select(target)` (§4.1): accepts a single name, a list of
    /// names, or an already-resolved `Template`.
    pub fn get_or_select(&self, target: SelectTarget<'_>) -> Result<Template, Error> {
        match target {
            SelectTarget::Name(name) => self.get_template(name),
            SelectTarget::Names(names) => self.select_template(names),
            SelectTarget::Template(tmpl) => Ok(tmpl),
        }
    }

    /// `join-path(child, parent)` (§4.1): delegates to the loader's own
    /// join hook when it provides a non-empty result; otherwise resolves
    /// relative to `parent`'s directory using POSIX path rules.
    pub fn join_path(&self, child: &str, parent: &str) -> String {
        match self.0.loader.read().unwrap().as_ref() {
            Some(loader) => {
                let joined = loader.join_path(child, parent);
                if joined.is_empty() {
                    crate::loader::default_join_path(child, parent)
                } else {
                    joined
                }
            }
            None => crate::loader::default_join_path(child, parent),
        }
    }

    /// `render(name, vars)` (§6): loads `name` and renders it to a string.
    pub fn render<S: serde::Serialize>(&self, name: &str, vars: S) -> Result<String, Error> {
        self.get_template(name)?.render(vars)
    }

    /// `render-to-writer(name, vars, writer)` (§6).
    pub fn render_to_write<S: serde::Serialize, W: std::fmt::Write>(
        &self,
        name: &str,
        vars: S,
        writer: &mut W,
    ) -> Result<(), Error> {
        self.get_template(name)?.render_to_write(vars, writer)
    }

    /// `generate(name, vars)` (§5 "Streaming render"): renders fully, then
    /// splits the output into top-level fragments (one per raw-text/output
    /// node boundary) so a caller can consume the render lazily. This core
    /// is synchronous and CPU-bound end to end (no `{% filter %}`/async
    /// suspension to straddle), so producer and consumer share no real
    /// concurrency; the fragment boundaries exist to honor the contract,
    /// not to overlap work with rendering.
    pub fn generate<S: serde::Serialize>(&self, name: &str, vars: S) -> Result<Vec<String>, Error> {
        let rendered = self.render(name, vars)?;
        Ok(crate::output::split_fragments(&rendered))
    }

    /// `generate-to-writer(name, vars, writer)`: writes each fragment from
    /// [`generate`] to `writer` in order.
    pub fn generate_to_write<S: serde::Serialize, W: std::fmt::Write>(
        &self,
        name: &str,
        vars: S,
        writer: &mut W,
    ) -> Result<(), Error> {
        for fragment in self.generate(name, vars)? {
            writer.write_str(&fragment).map_err(Error::from)?;
        }
        Ok(())
    }

    /// Compiles and renders `source` directly without registering it, for
    /// one-off templates (§6).
    pub fn render_str<S: serde::Serialize>(&self, source: &str, ctx: S) -> Result<String, Error> {
        let ast = crate::parser::parse(source, "<string>")?;
        let compiled = Arc::new(CompiledTemplate {
            name: "<string>".into(),
            source: source.into(),
            ast: Arc::new(ast),
            mtime: None,
        });
        Template::new(self.clone(), compiled).render(ctx)
    }

    /// The environment signature a bytecode cache should key on: every
    /// setting that affects how a template compiles or evaluates (§3
    /// `BytecodeArtifact`, §6 signature formula). This is the exact string
    /// used to key the bytecode cache (`EnvironmentInner::signature`), so an
    /// artifact survives only when every compile/eval-affecting setting still
    /// matches (§8 property 7).
    pub fn signature(&self) -> String {
        self.0.signature()
    }
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}

/// The argument to [`Environment::get_or_select`] (§4.1 `get-or-select`).
pub enum SelectTarget<'a> {
    Name(&'a str),
    Names(&'a [&'a str]),
    Template(Template),
}

impl EnvironmentInner {
    pub fn load_compiled(&self, name: &str) -> Result<Arc<CompiledTemplate>, Error> {
        let auto_reload = self.settings.read().unwrap().auto_reload;
        let loader = self.loader.read().unwrap();
        match loader.as_ref() {
            Some(loader) => {
                if self.cache.never_loaded(name) {
                    if let Some(bc) = self.bytecode_cache.read().unwrap().as_ref() {
                        let key = format!("{name}|{}", self.signature());
                        if let Some(source) = bc.load(&key) {
                            return self.cache.insert_source(name, &source);
                        }
                    }
                }
                let compiled = self.cache.get_or_compile(name, loader.as_ref(), auto_reload)?;
                if let Some(bc) = self.bytecode_cache.read().unwrap().as_ref() {
                    let key = format!("{name}|{}", self.signature());
                    bc.store(&key, compiled.source.clone());
                }
                Ok(compiled)
            }
            None => {
                let notfound_loader = crate::loader::MapLoader::new();
                self.cache.get_or_compile(name, &notfound_loader, false).map_err(|_| {
                    Error::new(
                        ErrorKind::TemplateNotFound,
                        format!("template `{name}` not found; no loader configured and it was not added via add_template"),
                    )
                })
            }
        }
    }

    /// §6 signature formula:
    /// `autoescape=..|trim=..|lstrip=..|keep=..|lineStmt=..|lineComment=..|async=..|newline=..|extensions=..`.
    /// Autoescape is callback-driven (per-template, not a single env-wide
    /// value) so the env-wide signature can only record that it's
    /// dynamically resolved, not which mode a given template gets.
    fn signature(&self) -> String {
        let s = self.settings.read().unwrap();
        format!(
            "autoescape=dynamic|trim={}|lstrip={}|keep={}|lineStmt={}|lineComment={}|async={}|newline=\\n|extensions={}",
            s.trim_blocks,
            s.lstrip_blocks,
            s.keep_trailing_newline,
            s.line_statement_prefix.as_deref().unwrap_or(""),
            s.line_comment_prefix.as_deref().unwrap_or(""),
            cfg!(feature = "async"),
            enabled_extensions(),
        )
    }

    pub fn get_filter(&self, name: &str) -> Option<Arc<NativeFunc>> {
        self.filters.read().unwrap().get(name).cloned()
    }

    pub fn get_test(&self, name: &str) -> Option<Arc<NativeFunc>> {
        self.tests.read().unwrap().get(name).cloned()
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.read().unwrap().get(name).cloned()
    }

    pub fn autoescape_for(&self, name: &str) -> AutoEscape {
        (self.autoescape_callback.read().unwrap())(name)
    }

    pub fn security_policy(&self) -> Option<Arc<SecurityPolicy>> {
        self.security_policy.read().unwrap().clone()
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    pub fn finalize(&self, value: &Value) -> Option<Value> {
        self.finalize.read().unwrap().as_ref().and_then(|f| f(value))
    }

    pub fn make_undefined(&self, name: &str) -> Value {
        if let Some(factory) = self.undefined_factory.read().unwrap().as_ref() {
            return factory(name);
        }
        Value::undefined(name.to_string(), self.settings.read().unwrap().undefined_kind)
    }

    pub fn url_for(&self, args: &[Value], kwargs: &crate::value::Kwargs) -> Option<Result<Value, Error>> {
        self.url_for.read().unwrap().as_ref().map(|f| f(args, kwargs))
    }

    pub fn i18n(&self) -> I18nHooks {
        self.i18n.read().unwrap().clone()
    }
}

