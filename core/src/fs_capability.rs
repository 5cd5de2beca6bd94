//! File capability: read, write, list, probe, and mkdir within configured
//! roots, honoring a read-only flag.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use crate::capability::Args;
use crate::capability::Capability;
use crate::capability::OperationSpec;
use crate::capability::optional_bool;
use crate::capability::optional_str;
use crate::capability::optional_str_list;
use crate::capability::require_str;
use crate::contract::Contract;
use crate::contract::pattern_matches;
use crate::error::CapabilityError;
use crate::path_guard;

const OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "read",
        params: &["path"],
        signature: "(path)",
        doc: "Read a file as text.",
    },
    OperationSpec {
        name: "write",
        params: &["path", "content"],
        signature: "(path, content)",
        doc: "Write text to a file, creating parent directories.",
    },
    OperationSpec {
        name: "list",
        params: &["pattern"],
        signature: "(pattern='*')",
        doc: "List files matching a glob pattern under the allowed roots.",
    },
    OperationSpec {
        name: "exists",
        params: &["path"],
        signature: "(path)",
        doc: "Whether a path exists; false rather than an error when denied.",
    },
    OperationSpec {
        name: "mkdir",
        params: &["path"],
        signature: "(path)",
        doc: "Create a directory and any missing parents.",
    },
    OperationSpec {
        name: "describe",
        params: &[],
        signature: "()",
        doc: "Documentation for this capability.",
    },
];

/// Read and write files within allowed roots.
#[derive(Debug, Clone)]
pub struct FileCapability {
    roots: Vec<PathBuf>,
    read_only: bool,
}

impl FileCapability {
    pub fn new<I, P>(roots: I, read_only: bool) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            roots: path_guard::normalize_roots(roots),
            read_only,
        }
    }

    /// Unrestricted over the whole filesystem.
    pub fn unrestricted(read_only: bool) -> Self {
        Self {
            roots: Vec::new(),
            read_only,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn cwd(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    /// Resolve and containment-check a path, refusing when it escapes the
    /// roots.
    fn check_path(&self, path: &str) -> Result<PathBuf, CapabilityError> {
        let resolved = path_guard::resolve_path(Path::new(path), &self.cwd());
        if self.roots.is_empty() || path_guard::is_path_allowed(&resolved, &self.roots) {
            Ok(resolved)
        } else {
            let allowed = self
                .roots
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(CapabilityError::Permission(format!(
                "access denied: '{path}' is outside allowed paths ({allowed})"
            )))
        }
    }

    fn ensure_writable(&self) -> Result<(), CapabilityError> {
        if self.read_only {
            Err(CapabilityError::Permission(
                "this file capability is read-only".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn read(&self, path: &str) -> Result<String, CapabilityError> {
        let resolved = self.check_path(path)?;
        tracing::debug!(path = %resolved.display(), "fs read");
        fs::read_to_string(&resolved).map_err(CapabilityError::from)
    }

    pub fn write(&self, path: &str, content: &str) -> Result<(), CapabilityError> {
        self.ensure_writable()?;
        let resolved = self.check_path(path)?;
        tracing::debug!(path = %resolved.display(), bytes = content.len(), "fs write");
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&resolved, content)?;
        Ok(())
    }

    /// Enumerate matches of `pattern` under each root. Returned paths are
    /// absolute and sorted lexicographically across roots.
    pub fn list(&self, pattern: &str) -> Result<Vec<String>, CapabilityError> {
        let roots = if self.roots.is_empty() {
            vec![self.cwd()]
        } else {
            self.roots.clone()
        };
        let mut results = Vec::new();
        for root in &roots {
            if !root.is_dir() {
                continue;
            }
            tracing::debug!(root = %root.display(), pattern, "fs list");
            collect_matches(root, root, pattern, &mut results)?;
        }
        results.sort();
        Ok(results)
    }

    pub fn exists(&self, path: &str) -> bool {
        match self.check_path(path) {
            Ok(resolved) => resolved.exists(),
            Err(_) => false,
        }
    }

    pub fn mkdir(&self, path: &str) -> Result<(), CapabilityError> {
        self.ensure_writable()?;
        let resolved = self.check_path(path)?;
        tracing::debug!(path = %resolved.display(), "fs mkdir");
        fs::create_dir_all(&resolved)?;
        Ok(())
    }
}

fn collect_matches(
    root: &Path,
    dir: &Path,
    pattern: &str,
    results: &mut Vec<String>,
) -> Result<(), CapabilityError> {
    let entries = fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if let Ok(relative) = path.strip_prefix(root) {
            let candidate = format!("file:/{}", relative.display());
            let rooted_pattern = format!("file:/{pattern}");
            if pattern_matches(&rooted_pattern, &candidate) {
                results.push(path.display().to_string());
            }
        }
        if path.is_dir() {
            collect_matches(root, &path, pattern, results)?;
        }
    }
    Ok(())
}

impl Capability for FileCapability {
    fn name(&self) -> &str {
        "fs"
    }

    fn description(&self) -> &str {
        "Read and write files within allowed paths."
    }

    fn contract(&self) -> Contract {
        let patterns: std::collections::BTreeSet<String> = if self.roots.is_empty() {
            ["file:**".to_string()].into_iter().collect()
        } else {
            self.roots
                .iter()
                .map(|root| format!("file:{}/**", root.display()))
                .collect()
        };
        Contract {
            reads: patterns.clone(),
            writes: if self.read_only {
                Default::default()
            } else {
                patterns
            },
            ..Default::default()
        }
    }

    fn operations(&self) -> Vec<OperationSpec> {
        OPERATIONS.to_vec()
    }

    fn invoke(&self, method: &str, args: &Args) -> Result<Value, CapabilityError> {
        match method {
            "read" => {
                let path = require_str(args, "path")?;
                Ok(Value::String(self.read(path)?))
            }
            "write" => {
                let path = require_str(args, "path")?;
                let content = require_str(args, "content")?;
                self.write(path, content)?;
                Ok(Value::Bool(true))
            }
            "list" => {
                let pattern = optional_str(args, "pattern")?.unwrap_or("*");
                Ok(json!(self.list(pattern)?))
            }
            "exists" => {
                let path = require_str(args, "path")?;
                Ok(Value::Bool(self.exists(path)))
            }
            "mkdir" => {
                let path = require_str(args, "path")?;
                self.mkdir(path)?;
                Ok(Value::Bool(true))
            }
            "describe" => Ok(Value::String(self.describe())),
            other => Err(self.unknown_method(other)),
        }
    }

    /// Restrictions: `read_only` (monotonically hardened) and `paths`
    /// (must already lie inside the parent's roots).
    fn derive(&self, restrictions: &Args) -> Result<Arc<dyn Capability>, CapabilityError> {
        let read_only = optional_bool(restrictions, "read_only")?.unwrap_or(self.read_only);
        let requested = optional_str_list(restrictions, "paths")?;

        let roots = match requested {
            None => self.roots.clone(),
            Some(paths) => {
                let resolved = path_guard::normalize_roots(&paths);
                if !self.roots.is_empty() {
                    for root in &resolved {
                        if !path_guard::is_path_allowed(root, &self.roots) {
                            return Err(CapabilityError::Broadened(format!(
                                "path '{}' is outside the parent's roots",
                                root.display()
                            )));
                        }
                    }
                }
                resolved
            }
        };

        Ok(Arc::new(FileCapability {
            roots,
            read_only: read_only || self.read_only,
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn rooted(dir: &TempDir, read_only: bool) -> FileCapability {
        FileCapability::new([dir.path()], read_only)
    }

    #[test]
    fn read_outside_roots_is_denied() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        let err = cap.read("/tmp/definitely-elsewhere/x").err().expect("deny");
        assert!(err.to_string().contains("outside allowed paths"), "{err}");
    }

    #[test]
    fn sibling_with_shared_prefix_is_denied() {
        let parent = TempDir::new().expect("tempdir");
        let root = parent.path().join("root");
        fs::create_dir_all(&root).expect("mkdir");
        let sibling = parent.path().join("root2");
        fs::create_dir_all(&sibling).expect("mkdir");
        fs::write(sibling.join("x"), "secret").expect("write");

        let cap = FileCapability::new([&root], false);
        let err = cap
            .read(&sibling.join("x").display().to_string())
            .err()
            .expect("deny");
        assert!(err.to_string().contains("outside allowed paths"), "{err}");
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        let target = dir.path().join("nested/deep/file.txt");
        cap.write(&target.display().to_string(), "hello")
            .expect("write");
        assert_eq!(
            cap.read(&target.display().to_string()).expect("read"),
            "hello"
        );
    }

    #[test]
    fn read_only_refuses_writes_and_mkdir() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, true);
        let target = dir.path().join("a.txt");
        let err = cap
            .write(&target.display().to_string(), "x")
            .err()
            .expect("deny");
        assert!(err.to_string().contains("read-only"), "{err}");
        let err = cap
            .mkdir(&dir.path().join("d").display().to_string())
            .err()
            .expect("deny");
        assert!(err.to_string().contains("read-only"), "{err}");
    }

    #[test]
    fn exists_returns_false_on_denied_paths() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        assert!(!cap.exists("/etc/passwd"));
        let inside = dir.path().join("present");
        fs::write(&inside, "x").expect("write");
        assert!(cap.exists(&inside.display().to_string()));
        assert!(!cap.exists(&dir.path().join("absent").display().to_string()));
    }

    #[test]
    fn list_is_sorted_and_absolute() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        fs::write(dir.path().join("b.py"), "").expect("write");
        fs::write(dir.path().join("a.py"), "").expect("write");
        fs::write(dir.path().join("c.txt"), "").expect("write");
        let canon = dir.path().canonicalize().expect("canonicalize");

        let listed = cap.list("*.py").expect("list");
        assert_eq!(
            listed,
            vec![
                canon.join("a.py").display().to_string(),
                canon.join("b.py").display().to_string(),
            ]
        );
    }

    #[test]
    fn list_descends_with_double_star() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        fs::write(dir.path().join("sub/x.txt"), "").expect("write");
        let listed = cap.list("**/*.txt").expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("sub/x.txt"));
    }

    #[test]
    fn contract_mirrors_roots_and_read_only() {
        let dir = TempDir::new().expect("tempdir");
        let canon = dir.path().canonicalize().expect("canonicalize");
        let cap = rooted(&dir, true);
        let contract = cap.contract();
        let expected = format!("file:{}/**", canon.display());
        assert!(contract.reads.contains(&expected));
        assert!(contract.writes.is_empty());
    }

    #[test]
    fn derive_hardens_read_only_and_subsets_contract() {
        let dir = TempDir::new().expect("tempdir");
        let cap = rooted(&dir, false);
        let restrictions: Args = serde_json::from_value(serde_json::json!({"read_only": true}))
            .expect("args");
        let derived = cap.derive(&restrictions).expect("derive");
        assert!(derived.contract().is_subset_of(&cap.contract()));

        let err = derived
            .invoke(
                "write",
                &serde_json::from_value(serde_json::json!({
                    "path": dir.path().join("a").display().to_string(),
                    "content": "x"
                }))
                .expect("args"),
            )
            .err()
            .expect("deny");
        assert!(err.to_string().contains("read-only"), "{err}");
    }

    #[test]
    fn derive_rejects_broadening() {
        let parent_dir = TempDir::new().expect("tempdir");
        let other_dir = TempDir::new().expect("tempdir");
        let cap = rooted(&parent_dir, false);
        let restrictions: Args = serde_json::from_value(serde_json::json!({
            "paths": [other_dir.path().display().to_string()]
        }))
        .expect("args");
        let err = cap.derive(&restrictions).err().expect("reject");
        assert!(matches!(err, CapabilityError::Broadened(_)), "{err}");
    }

    #[test]
    fn derive_narrows_to_subdirectory() {
        let dir = TempDir::new().expect("tempdir");
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).expect("mkdir");
        let cap = rooted(&dir, false);
        let restrictions: Args = serde_json::from_value(serde_json::json!({
            "paths": [sub.display().to_string()]
        }))
        .expect("args");
        let derived = cap.derive(&restrictions).expect("derive");
        assert!(derived.contract().is_subset_of(&cap.contract()));
    }
}
