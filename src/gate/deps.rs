//! Transitive helper dependency resolution for classic modules.
//!
//! Classic modules import shared libraries from two recognized namespaces:
//! the core namespace `ansible.module_utils.*` and the collection namespace
//! `ansible_collections.<ns>.<coll>.plugins.module_utils.*`. This module
//! scans a module's source for such imports, resolves each against the
//! helper search roots, and recurses into resolved helpers. Unresolved
//! imports are recorded but never fatal; the gate may still work without
//! them when the target has the libraries installed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::connection::config::expand_path;

/// `from ansible.module_utils.basic import X` / `import ansible.module_utils.basic`
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*(?:from\s+((?:ansible\.module_utils|ansible_collections\.[\w.]+?\.plugins\.module_utils)[\w.]*)\s+import|import\s+((?:ansible\.module_utils|ansible_collections\.[\w.]+?\.plugins\.module_utils)[\w.]*))",
    )
    .expect("invalid import regex")
});

/// One recognized helper import.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelperImport {
    /// The full dotted import path as written.
    pub import_path: String,
}

impl HelperImport {
    /// Whether this import targets the collection namespace.
    pub fn is_collection(&self) -> bool {
        self.import_path.starts_with("ansible_collections.")
    }

    /// For collection imports, the `(namespace, collection, module_path)`
    /// triple; `None` for core imports.
    pub fn collection_parts(&self) -> Option<(String, String, String)> {
        let rest = self.import_path.strip_prefix("ansible_collections.")?;
        let mut parts = rest.splitn(3, '.');
        let namespace = parts.next()?.to_string();
        let collection = parts.next()?.to_string();
        let tail = parts.next()?;
        let module_path = tail.strip_prefix("plugins.module_utils.")?.to_string();
        Some((namespace, collection, module_path))
    }

    /// For core imports, the dotted path below `ansible.module_utils`;
    /// empty for the bare package import.
    pub fn core_path(&self) -> Option<String> {
        let rest = self.import_path.strip_prefix("ansible.module_utils")?;
        Some(rest.strip_prefix('.').unwrap_or(rest).to_string())
    }
}

/// A helper resolved to a file on disk, with its path inside the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperFile {
    /// The import that produced this file.
    pub import_path: String,
    /// Where the helper lives on the controller.
    pub source_path: PathBuf,
    /// Where the helper is placed inside the archive, preserving its
    /// namespace.
    pub bundle_path: String,
}

/// Outcome of transitive resolution for one module.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    /// Helpers resolved to files, in discovery order.
    pub resolved: Vec<HelperFile>,
    /// Import paths that matched a recognized namespace but could not be
    /// found on any search root.
    pub unresolved: Vec<String>,
}

/// Resolver over a fixed set of helper search roots.
#[derive(Debug, Clone)]
pub struct HelperResolver {
    core_roots: Vec<PathBuf>,
    collection_roots: Vec<PathBuf>,
}

impl HelperResolver {
    /// Build a resolver with explicit search roots.
    pub fn new(core_roots: Vec<PathBuf>, collection_roots: Vec<PathBuf>) -> Self {
        Self {
            core_roots,
            collection_roots,
        }
    }

    /// Build a resolver from the environment and standard defaults.
    ///
    /// `FTL_MODULE_UTILS_PATH` and `ANSIBLE_COLLECTIONS_PATH` are honored as
    /// colon-separated lists prepended to the defaults.
    pub fn from_env() -> Self {
        let mut core_roots = colon_list("FTL_MODULE_UTILS_PATH");
        if let Some(home) = dirs::home_dir() {
            core_roots.push(home.join(".ansible").join("module_utils"));
        }
        core_roots.push(PathBuf::from("/usr/share/ansible/module_utils"));

        let mut collection_roots = colon_list("ANSIBLE_COLLECTIONS_PATH");
        if let Some(home) = dirs::home_dir() {
            collection_roots.push(home.join(".ansible").join("collections"));
        }
        collection_roots.push(PathBuf::from("/usr/share/ansible/collections"));

        Self::new(core_roots, collection_roots)
    }

    /// Scan Python source for imports from the recognized namespaces.
    pub fn scan_imports(source: &str) -> Vec<HelperImport> {
        let mut seen = HashSet::new();
        IMPORT_RE
            .captures_iter(source)
            .filter_map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().to_string())
            })
            .filter(|path| seen.insert(path.clone()))
            .map(|import_path| HelperImport { import_path })
            .collect()
    }

    /// Resolve one import to a helper file, if it exists on a search root.
    pub fn resolve_import(&self, import: &HelperImport) -> Option<HelperFile> {
        if let Some((namespace, collection, module_path)) = import.collection_parts() {
            let rel = module_path.replace('.', "/");
            for root in &self.collection_roots {
                let base = root
                    .join("ansible_collections")
                    .join(&namespace)
                    .join(&collection)
                    .join("plugins")
                    .join("module_utils");
                if let Some((path, suffix)) = probe(&base, &rel) {
                    return Some(HelperFile {
                        import_path: import.import_path.clone(),
                        source_path: path,
                        bundle_path: format!(
                            "ansible_collections/{namespace}/{collection}/plugins/module_utils/{rel}{suffix}"
                        ),
                    });
                }
            }
            return None;
        }

        let core = import.core_path()?;
        if core.is_empty() {
            return None;
        }
        let rel = core.replace('.', "/");
        for root in &self.core_roots {
            if let Some((path, suffix)) = probe(root, &rel) {
                return Some(HelperFile {
                    import_path: import.import_path.clone(),
                    source_path: path,
                    bundle_path: format!("ansible/module_utils/{rel}{suffix}"),
                });
            }
        }
        None
    }

    /// The transitive helper set for one module source file.
    pub fn dependencies(&self, module_path: &Path) -> std::io::Result<DependencyReport> {
        let mut report = DependencyReport::default();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut queue: Vec<PathBuf> = vec![module_path.to_path_buf()];

        while let Some(path) = queue.pop() {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if !visited.insert(canonical) {
                continue;
            }

            let source = match std::fs::read_to_string(&path) {
                Ok(s) => s,
                // Binary modules have no scannable imports.
                Err(_) => continue,
            };

            for import in Self::scan_imports(&source) {
                match self.resolve_import(&import) {
                    Some(helper) => {
                        if !report.resolved.contains(&helper) {
                            queue.push(helper.source_path.clone());
                            report.resolved.push(helper);
                        }
                    }
                    None => {
                        if !report.unresolved.contains(&import.import_path) {
                            report.unresolved.push(import.import_path);
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

/// Try `<base>/<rel>.py`, then a package directory `<base>/<rel>/__init__.py`.
fn probe(base: &Path, rel: &str) -> Option<(PathBuf, &'static str)> {
    let file = base.join(format!("{rel}.py"));
    if file.is_file() {
        return Some((file, ".py"));
    }
    let package = base.join(rel).join("__init__.py");
    if package.is_file() {
        return Some((package, "/__init__.py"));
    }
    None
}

/// Collection search roots: `ANSIBLE_COLLECTIONS_PATH` plus the standard
/// locations.
pub fn collection_search_roots() -> Vec<PathBuf> {
    let mut roots = colon_list("ANSIBLE_COLLECTIONS_PATH");
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".ansible").join("collections"));
    }
    roots.push(PathBuf::from("/usr/share/ansible/collections"));
    roots
}

fn colon_list(var: &str) -> Vec<PathBuf> {
    std::env::var(var)
        .map(|v| {
            v.split(':')
                .filter(|s| !s.is_empty())
                .map(expand_path)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scan_from_import() {
        let source = "from ansible.module_utils.basic import AnsibleModule\n";
        let imports = HelperResolver::scan_imports(source);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].import_path, "ansible.module_utils.basic");
        assert!(!imports[0].is_collection());
        assert_eq!(imports[0].core_path().unwrap(), "basic");
    }

    #[test]
    fn test_scan_multiple_imports() {
        let source = "\
from ansible.module_utils.basic import AnsibleModule
from ansible.module_utils.common.text.converters import to_text
import ansible.module_utils.urls
";
        let imports = HelperResolver::scan_imports(source);
        let paths: Vec<_> = imports.iter().map(|i| i.import_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "ansible.module_utils.basic",
                "ansible.module_utils.common.text.converters",
                "ansible.module_utils.urls",
            ]
        );
    }

    #[test]
    fn test_scan_collection_import() {
        let source =
            "from ansible_collections.amazon.aws.plugins.module_utils.ec2 import AWSRetry\n";
        let imports = HelperResolver::scan_imports(source);
        assert_eq!(imports.len(), 1);
        assert!(imports[0].is_collection());
        let (ns, coll, path) = imports[0].collection_parts().unwrap();
        assert_eq!(ns, "amazon");
        assert_eq!(coll, "aws");
        assert_eq!(path, "ec2");
    }

    #[test]
    fn test_scan_ignores_other_imports() {
        let source = "\
import os
import json
from pathlib import Path
from ansible.plugins.callback import CallbackBase
";
        assert!(HelperResolver::scan_imports(source).is_empty());
    }

    #[test]
    fn test_resolve_core_helper() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("common")).unwrap();
        std::fs::write(root.join("basic.py"), "# basic\n").unwrap();
        std::fs::write(root.join("common/__init__.py"), "").unwrap();

        let resolver = HelperResolver::new(vec![root], vec![]);
        let helper = resolver
            .resolve_import(&HelperImport {
                import_path: "ansible.module_utils.basic".to_string(),
            })
            .unwrap();
        assert_eq!(helper.bundle_path, "ansible/module_utils/basic.py");

        let package = resolver
            .resolve_import(&HelperImport {
                import_path: "ansible.module_utils.common".to_string(),
            })
            .unwrap();
        assert_eq!(
            package.bundle_path,
            "ansible/module_utils/common/__init__.py"
        );
    }

    #[test]
    fn test_transitive_resolution_with_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let helpers = dir.path().join("module_utils");
        std::fs::create_dir_all(&helpers).unwrap();
        // a imports b, b imports a: the visited set breaks the cycle.
        std::fs::write(
            helpers.join("a.py"),
            "from ansible.module_utils.b import thing\n",
        )
        .unwrap();
        std::fs::write(
            helpers.join("b.py"),
            "from ansible.module_utils.a import other\n",
        )
        .unwrap();

        let module = dir.path().join("mymodule.py");
        std::fs::write(&module, "from ansible.module_utils.a import thing\n").unwrap();

        let resolver = HelperResolver::new(vec![helpers], vec![]);
        let report = resolver.dependencies(&module).unwrap();
        let bundles: Vec<_> = report.resolved.iter().map(|h| h.bundle_path.as_str()).collect();
        assert!(bundles.contains(&"ansible/module_utils/a.py"));
        assert!(bundles.contains(&"ansible/module_utils/b.py"));
        assert_eq!(report.resolved.len(), 2);
        assert!(report.unresolved.is_empty());
    }

    #[test]
    fn test_unresolved_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("mymodule.py");
        std::fs::write(
            &module,
            "from ansible.module_utils.nonexistent import thing\n",
        )
        .unwrap();

        let resolver = HelperResolver::new(vec![], vec![]);
        let report = resolver.dependencies(&module).unwrap();
        assert!(report.resolved.is_empty());
        assert_eq!(report.unresolved, vec!["ansible.module_utils.nonexistent"]);
    }

    #[test]
    fn test_resolve_collection_helper() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mu = root
            .join("ansible_collections/amazon/aws/plugins/module_utils");
        std::fs::create_dir_all(&mu).unwrap();
        std::fs::write(mu.join("ec2.py"), "# ec2 helpers\n").unwrap();

        let resolver = HelperResolver::new(vec![], vec![root]);
        let helper = resolver
            .resolve_import(&HelperImport {
                import_path: "ansible_collections.amazon.aws.plugins.module_utils.ec2"
                    .to_string(),
            })
            .unwrap();
        assert_eq!(
            helper.bundle_path,
            "ansible_collections/amazon/aws/plugins/module_utils/ec2.py"
        );
    }
}
