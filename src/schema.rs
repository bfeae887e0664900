//! Desired-state schema and last-known-state snapshot files.
//!
//! Schema file:
//! ```yaml
//! desired_state:
//!   auth/approle:
//!     type: approle
//!   secret/data/app:
//!     api_key: abc123
//! ```
//!
//! The snapshot (`.state.yaml` in the migrations directory) records the
//! desired state of the last generated migration under `last_known_state`.

use crate::error::{MigrationError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Path -> value tree, iterated in path order.
pub type StateTree = BTreeMap<String, Value>;

/// Snapshot file name inside the migrations directory
pub const SNAPSHOT_FILE: &str = ".state.yaml";

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    desired_state: Option<StateTree>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    last_known_state: Option<StateTree>,
}

/// Load the `desired_state` tree of a schema file.
pub fn load_desired_state(path: impl AsRef<Path>) -> Result<StateTree> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| MigrationError::parse(path, e))?;
    let schema: SchemaFile =
        serde_yaml::from_str(&content).map_err(|e| MigrationError::parse(path, e))?;
    schema
        .desired_state
        .ok_or_else(|| MigrationError::parse(path, "schema file must contain desired_state"))
}

pub fn snapshot_path(directory: impl AsRef<Path>) -> PathBuf {
    directory.as_ref().join(SNAPSHOT_FILE)
}

/// Last-known state, `None` when no snapshot was ever written.
pub fn load_snapshot(directory: impl AsRef<Path>) -> Result<Option<StateTree>> {
    let path = snapshot_path(directory);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MigrationError::parse(&path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    let snapshot: SnapshotFile =
        serde_yaml::from_str(&content).map_err(|e| MigrationError::parse(&path, e))?;
    Ok(snapshot.last_known_state)
}

pub fn save_snapshot(directory: impl AsRef<Path>, state: &StateTree) -> Result<()> {
    let path = snapshot_path(directory);
    let snapshot = SnapshotFile {
        last_known_state: Some(state.clone()),
    };
    let yaml = serde_yaml::to_string(&snapshot).map_err(|e| MigrationError::parse(&path, e))?;
    fs::write(&path, yaml)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};
    use std::io::Write;

    #[test]
    fn test_load_desired_state() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            b"desired_state:\n  auth/approle:\n    type: approle\n  sys/mounts/kv:\n    type: kv\n",
        )
        .unwrap();
        file.flush().unwrap();

        let tree = load_desired_state(file.path()).unwrap();
        let paths: Vec<&str> = tree.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["auth/approle", "sys/mounts/kv"]);
    }

    #[test]
    fn test_missing_desired_state_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"something_else: {}\n").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_desired_state(file.path()),
            Err(MigrationError::Parse { .. })
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_snapshot(dir.path()).unwrap(), None);

        let mut state = StateTree::new();
        state.insert("auth/approle".to_string(), serde_yaml::from_str("{type: approle}").unwrap());
        save_snapshot(dir.path(), &state).unwrap();

        let raw = fs::read_to_string(dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert!(raw.starts_with("last_known_state:"));
        assert_eq!(load_snapshot(dir.path()).unwrap(), Some(state));
    }

    #[test]
    fn test_null_snapshot_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        fs::write(snapshot_path(dir.path()), "last_known_state: null\n").unwrap();
        assert_eq!(load_snapshot(dir.path()).unwrap(), None);
    }
}
