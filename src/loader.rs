//! Template source loading (§3 `Loader`).
//!
//! A [`Loader`] turns a template name into source text. Implementations
//! decide what "name" means: a filesystem-relative path, a map key, a
//! database row. The environment never interprets names itself beyond
//! passing them through `join_path` for relative `{% include %}`/`{% import
//! %}` resolution.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Error, ErrorKind};

/// Source text plus an optional modification marker used by the bytecode
/// cache to decide whether a cached compile is still valid (§3 cache
/// invalidation).
pub struct LoadedSource {
    pub source: String,
    pub mtime: Option<u64>,
}

pub trait Loader: Send + Sync {
    /// Loads the named template, or returns a `TemplateNotFound` error
    /// listing every path that was attempted.
    fn load(&self, name: &str) -> Result<LoadedSource, Error>;

    /// Resolves `name` as seen from `parent`, for relative includes. The
    /// default performs no resolution (names are always absolute).
    fn join_path(&self, name: &str, _parent: &str) -> String {
        name.to_string()
    }

    /// Lists known template names, if the loader can enumerate them.
    fn list_names(&self) -> Option<Vec<String>> {
        None
    }
}

/// The environment-level fallback for `join-path` when no loader is
/// installed or the loader's own hook returns an empty string (§4.1):
/// absolute children pass through; otherwise resolve relative to the
/// parent's directory using POSIX path rules.
pub fn default_join_path(child: &str, parent: &str) -> String {
    if let Some(rest) = child.strip_prefix('/') {
        return normalize_posix(rest);
    }
    match parent.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => normalize_posix(&format!("{dir}/{child}")),
        _ => normalize_posix(child),
    }
}

fn normalize_posix(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Loads templates from one or more filesystem directories, searched in
/// order (first match wins), matching common static-site/web-framework
/// conventions.
pub struct FileSystemLoader {
    roots: Vec<PathBuf>,
}

impl FileSystemLoader {
    pub fn new<I, P>(roots: I) -> FileSystemLoader
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        FileSystemLoader {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }
}

impl Loader for FileSystemLoader {
    fn load(&self, name: &str) -> Result<LoadedSource, Error> {
        if name.contains("..") {
            return Err(Error::new(
                ErrorKind::TemplateNotFound,
                format!("template name `{name}` may not contain `..`"),
            ));
        }
        let mut attempted = Vec::new();
        for root in &self.roots {
            let path = root.join(name);
            match fs::read_to_string(&path) {
                Ok(source) => {
                    let mtime = fs::metadata(&path)
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs());
                    return Ok(LoadedSource { source, mtime });
                }
                Err(_) => attempted.push(path),
            }
        }
        Err(Error::new(
            ErrorKind::TemplateNotFound,
            format!(
                "template `{name}` not found; tried: {}",
                attempted
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ))
    }

    fn join_path(&self, name: &str, parent: &str) -> String {
        if name.starts_with('/') {
            return name.trim_start_matches('/').to_string();
        }
        match Path::new(parent).parent() {
            Some(dir) if dir.as_os_str().len() > 0 => {
                dir.join(name).to_string_lossy().replace('\\', "/")
            }
            _ => name.to_string(),
        }
    }

    fn list_names(&self) -> Option<Vec<String>> {
        let mut names = Vec::new();
        for root in &self.roots {
            collect_names(root, root, &mut names);
        }
        Some(names)
    }
}

fn collect_names(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_names(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Loads templates from an in-memory name-to-source map, for tests and
/// embedded-template deployments.
pub struct MapLoader {
    templates: RwLock<HashMap<String, String>>,
}

impl MapLoader {
    pub fn new() -> MapLoader {
        MapLoader {
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, name: impl Into<String>, source: impl Into<String>) {
        self.templates
            .write()
            .unwrap()
            .insert(name.into(), source.into());
    }

    pub fn remove(&self, name: &str) {
        self.templates.write().unwrap().remove(name);
    }
}

impl Default for MapLoader {
    fn default() -> MapLoader {
        MapLoader::new()
    }
}

impl Loader for MapLoader {
    fn load(&self, name: &str) -> Result<LoadedSource, Error> {
        self.templates
            .read()
            .unwrap()
            .get(name)
            .map(|s| LoadedSource {
                source: s.clone(),
                mtime: None,
            })
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::TemplateNotFound,
                    format!("template `{name}` not found; tried: in-memory map"),
                )
            })
    }

    fn list_names(&self) -> Option<Vec<String>> {
        Some(self.templates.read().unwrap().keys().cloned().collect())
    }
}
