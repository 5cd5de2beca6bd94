//! Snapshot persistence: one JSON file per state name under a directory.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use capstan_protocol::SNAPSHOT_VERSION;
use capstan_protocol::SessionSnapshot;

use crate::error::Result;

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// State names are sanitized to alphanumerics plus `-` and `_` before
    /// they touch the filesystem.
    fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Stamp and persist a snapshot, returning its path.
    pub fn save(&self, name: &str, mut snapshot: SessionSnapshot) -> Result<PathBuf> {
        snapshot.version = SNAPSHOT_VERSION;
        snapshot.saved_at = chrono::Utc::now().to_rfc3339();
        let path = self.path_for(name);
        let text = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&path, text)?;
        tracing::info!(name, path = %path.display(), "saved state");
        Ok(path)
    }

    /// `Ok(None)` when no snapshot with that name exists.
    pub fn load(&self, name: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use capstan_protocol::SavedVariable;
    use capstan_protocol::VariableKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn snapshot_with_counter() -> SessionSnapshot {
        SessionSnapshot {
            variables: vec![SavedVariable {
                name: "counter".to_string(),
                kind: VariableKind::Value,
                payload: json!(5),
            }],
            history: vec!["counter = 5".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn save_load_round_trip_stamps_metadata() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path()).expect("store");

        store.save("default", snapshot_with_counter()).expect("save");
        let loaded = store.load("default").expect("load").expect("present");
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert!(!loaded.saved_at.is_empty());
        assert_eq!(loaded.variables.len(), 1);
        assert_eq!(loaded.history, vec!["counter = 5".to_string()]);
    }

    #[test]
    fn load_of_missing_state_is_none() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path()).expect("store");
        assert!(store.load("absent").expect("load").is_none());
    }

    #[test]
    fn names_are_sanitized() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path()).expect("store");
        store
            .save("weird name/../x", snapshot_with_counter())
            .expect("save");
        assert_eq!(store.list().expect("list"), vec!["weird_name____x"]);
        assert!(store.load("weird name/../x").expect("load").is_some());
    }

    #[test]
    fn delete_reports_presence() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path()).expect("store");
        store.save("a", snapshot_with_counter()).expect("save");
        assert!(store.delete("a").expect("delete"));
        assert!(!store.delete("a").expect("delete"));
        assert!(store.list().expect("list").is_empty());
    }
}
