//! Gate building, caching, and sessions.
//!
//! A gate is a self-contained executable archive shipped to a target and run
//! by the target's interpreter. It packages the protocol runtime, the
//! requested modules, and their transitive helpers. Archives are
//! content-addressed: the SHA-256 of the build inputs (including every
//! referenced file's bytes) keys a controller-side cache, so identical
//! requests never rebuild and concurrent builders converge on one file.

pub mod deps;
pub mod session;

pub use deps::{DependencyReport, HelperFile, HelperResolver};
pub use session::GateSession;

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// The gate runtime program, authored controller-side and embedded in every
/// archive as its entry point.
pub const GATE_RUNTIME: &str = include_str!("gate_main.py");

/// Errors raised while building or staging gates.
#[derive(Error, Debug)]
pub enum GateError {
    /// A requested module was not found on any search root.
    #[error("Module '{name}' not found (searched {searched:?})")]
    ModuleNotFound {
        /// Requested module name
        name: String,
        /// Directories that were searched
        searched: Vec<PathBuf>,
    },

    /// Helper imports could not be resolved and strict mode is on.
    #[error("Unresolved helper imports: {unresolved:?}")]
    DependencyResolutionFailed {
        /// Import paths that missed every search root
        unresolved: Vec<String>,
    },

    /// Filesystem or archive-format failure during the build.
    #[error("Gate build IO error: {0}")]
    BuildIo(String),
}

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        GateError::BuildIo(e.to_string())
    }
}

impl From<zip::result::ZipError> for GateError {
    fn from(e: zip::result::ZipError) -> Self {
        GateError::BuildIo(e.to_string())
    }
}

/// Immutable description of a gate to build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GateBuildConfig {
    /// Module names to bundle.
    pub modules: Vec<String>,
    /// Directories searched for module files.
    pub module_dirs: Vec<PathBuf>,
    /// Dependency strings recorded in the archive (requirement specifiers).
    pub dependencies: Vec<String>,
    /// Interpreter path on the target.
    pub interpreter: String,
}

impl GateBuildConfig {
    /// Config for a set of modules with the default target interpreter.
    pub fn new(modules: Vec<String>, module_dirs: Vec<PathBuf>) -> Self {
        Self {
            modules,
            module_dirs,
            dependencies: Vec::new(),
            interpreter: "/usr/bin/python3".to_string(),
        }
    }
}

/// A built (or cache-hit) gate archive.
#[derive(Debug, Clone)]
pub struct BuiltGate {
    /// Path of the archive in the cache directory.
    pub path: PathBuf,
    /// Content hash, also embedded in the filename.
    pub hash: String,
    /// Whether this build was served from cache.
    pub cache_hit: bool,
    /// Helper imports that missed every search root.
    pub unresolved: Vec<String>,
}

/// The controller-side cache directory for gate archives.
///
/// `FTL_CACHE_DIR` overrides the default of `~/.ftl`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FTL_CACHE_DIR") {
        if !dir.is_empty() {
            return crate::connection::config::expand_path(&dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ftl")
}

/// Find a module file: source files first across all roots, then bare
/// executables.
pub fn find_module(module_dirs: &[PathBuf], module_name: &str) -> Option<PathBuf> {
    let short = module_name.rsplit('.').next().unwrap_or(module_name);

    for dir in module_dirs {
        let candidate = dir.join(format!("{short}.py"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    for dir in module_dirs {
        let candidate = dir.join(short);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Builds and caches gate archives.
pub struct GateBuilder {
    cache_dir: PathBuf,
    resolver: HelperResolver,
    /// Fail the build when helper imports cannot be resolved.
    strict_dependencies: bool,
}

impl GateBuilder {
    /// Create a builder over a cache directory, using environment-derived
    /// helper search roots.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            resolver: HelperResolver::from_env(),
            strict_dependencies: false,
        }
    }

    /// Replace the helper resolver (used to pin search roots).
    pub fn with_resolver(mut self, resolver: HelperResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Fail instead of warning when helper imports cannot be resolved.
    pub fn with_strict_dependencies(mut self) -> Self {
        self.strict_dependencies = true;
        self
    }

    /// The cache directory this builder writes to.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve every requested module to a path, preserving request order.
    fn resolve_modules(
        &self,
        config: &GateBuildConfig,
    ) -> Result<Vec<(String, PathBuf)>, GateError> {
        config
            .modules
            .iter()
            .map(|name| {
                find_module(&config.module_dirs, name)
                    .map(|path| (name.clone(), path))
                    .ok_or_else(|| GateError::ModuleNotFound {
                        name: name.clone(),
                        searched: config.module_dirs.clone(),
                    })
            })
            .collect()
    }

    /// Content hash of a config: SHA-256 over its canonical serialization
    /// plus the bytes of every referenced module file.
    ///
    /// Equal hashes guarantee byte-identical archives.
    pub fn content_hash(&self, config: &GateBuildConfig) -> Result<String, GateError> {
        let resolved = self.resolve_modules(config)?;

        let mut hasher = Sha256::new();

        hasher.update(b"modules\0");
        let mut names: Vec<&str> = config.modules.iter().map(String::as_str).collect();
        names.sort_unstable();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }

        hasher.update(b"dirs\0");
        let mut dirs: Vec<String> = config
            .module_dirs
            .iter()
            .map(|d| {
                d.canonicalize()
                    .unwrap_or_else(|_| d.clone())
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        dirs.sort_unstable();
        for dir in dirs {
            hasher.update(dir.as_bytes());
            hasher.update(b"\0");
        }

        hasher.update(b"deps\0");
        let mut deps: Vec<&str> = config.dependencies.iter().map(String::as_str).collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update(b"\0");
        }

        hasher.update(b"interp\0");
        hasher.update(config.interpreter.as_bytes());
        hasher.update(b"\0");

        let mut by_name: BTreeMap<&str, &PathBuf> = BTreeMap::new();
        for (name, path) in &resolved {
            by_name.insert(name, path);
        }
        for (name, path) in by_name {
            let bytes = std::fs::read(path)?;
            hasher.update(b"mod\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(Sha256::digest(&bytes));
        }

        Ok(hex_string(&hasher.finalize()))
    }

    /// Build the archive for a config, or return the cached one.
    ///
    /// Publication is write-once-rename: the archive is assembled in a
    /// sibling tempfile and renamed onto `gate_<hash>.pyz`, so concurrent
    /// builders of the same hash converge on a single identical file.
    pub fn build(&self, config: &GateBuildConfig) -> Result<BuiltGate, GateError> {
        std::fs::create_dir_all(&self.cache_dir)?;

        let hash = self.content_hash(config)?;
        let final_path = self.cache_dir.join(format!("gate_{hash}.pyz"));

        if final_path.exists() {
            debug!(path = %final_path.display(), "Gate cache hit");
            return Ok(BuiltGate {
                path: final_path,
                hash,
                cache_hit: true,
                unresolved: Vec::new(),
            });
        }

        let resolved = self.resolve_modules(config)?;

        // Transitive helpers across all modules, deduplicated by bundle path.
        let mut helpers: BTreeMap<String, HelperFile> = BTreeMap::new();
        let mut unresolved: Vec<String> = Vec::new();
        for (_, path) in &resolved {
            let report = self.resolver.dependencies(path)?;
            for helper in report.resolved {
                helpers.entry(helper.bundle_path.clone()).or_insert(helper);
            }
            for miss in report.unresolved {
                if !unresolved.contains(&miss) {
                    unresolved.push(miss);
                }
            }
        }
        if !unresolved.is_empty() {
            if self.strict_dependencies {
                return Err(GateError::DependencyResolutionFailed { unresolved });
            }
            warn!(
                unresolved = ?unresolved,
                "Helper imports unresolved; the target may need them installed"
            );
        }

        let tmp = tempfile::Builder::new()
            .prefix(".gate-")
            .suffix(".pyz.tmp")
            .tempfile_in(&self.cache_dir)?;

        self.write_archive(tmp.as_file(), config, &resolved, &helpers)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&final_path)
            .map_err(|e| GateError::BuildIo(e.error.to_string()))?;

        debug!(path = %final_path.display(), hash = %hash, "Gate built");
        Ok(BuiltGate {
            path: final_path,
            hash,
            cache_hit: false,
            unresolved,
        })
    }

    /// Write the zip archive: entry point, package marker, bundled modules
    /// at predictable paths, helpers preserving their namespace, and the
    /// recorded dependency list. Entry order and timestamps are fixed so
    /// equal inputs produce equal bytes.
    fn write_archive(
        &self,
        file: &std::fs::File,
        config: &GateBuildConfig,
        resolved: &[(String, PathBuf)],
        helpers: &BTreeMap<String, HelperFile>,
    ) -> Result<(), GateError> {
        use zip::write::SimpleFileOptions;

        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);

        zip.start_file("__main__.py", options)?;
        zip.write_all(GATE_RUNTIME.as_bytes())?;

        zip.start_file("ftl_gate/__init__.py", options)?;
        zip.write_all(b"")?;

        let mut by_name: BTreeMap<&str, &PathBuf> = BTreeMap::new();
        for (name, path) in resolved {
            by_name.insert(name, path);
        }
        for (name, path) in by_name {
            let bytes = std::fs::read(path)?;
            let filename = if path.extension().map(|e| e == "py").unwrap_or(false) {
                format!("{name}.py")
            } else {
                name.to_string()
            };
            zip.start_file(format!("ftl_gate/modules/{filename}"), options)?;
            zip.write_all(&bytes)?;
        }

        for helper in helpers.values() {
            let bytes = std::fs::read(&helper.source_path)?;
            zip.start_file(helper.bundle_path.as_str(), options)?;
            zip.write_all(&bytes)?;
        }

        if !config.dependencies.is_empty() {
            let mut deps = config.dependencies.clone();
            deps.sort_unstable();
            zip.start_file("requirements.txt", options)?;
            zip.write_all(deps.join("\n").as_bytes())?;
            zip.write_all(b"\n")?;
        }

        zip.finish()?;
        Ok(())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
