//! Change-set discovery.
//!
//! Every `*.yaml` / `*.yml` file in the migrations directory is one
//! change-set. The file name carries no meaning; the embedded `version`
//! decides ordering. Hidden files (the diff snapshot, the local cursor) are
//! skipped.

use crate::error::{MigrationError, Result};
use crate::migration::ChangeSet;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{Span, debug};

/// Loads and orders the change-sets of one directory.
#[derive(Debug, Clone)]
pub struct MigrationLoader {
    directory: PathBuf,
    span: Span,
}

impl MigrationLoader {
    pub fn new(directory: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            directory: directory.into(),
            span,
        }
    }

    /// All change-sets, ascending by version.
    ///
    /// A file that cannot be read or parsed aborts the load: a change-set
    /// must never drop out of the plan silently.
    pub fn load(&self) -> Result<Vec<ChangeSet>> {
        let _enter = self.span.enter();

        if !self.directory.is_dir() {
            return Err(MigrationError::config(format!(
                "migrations directory does not exist: {}",
                self.directory.display()
            )));
        }

        let mut by_version: BTreeMap<u64, (PathBuf, ChangeSet)> = BTreeMap::new();
        for path in self.candidate_files()? {
            let change_set = parse_file(&path)?;
            change_set.validate()?;

            let version = change_set.version;
            if let Some((first, _)) = by_version.get(&version) {
                return Err(MigrationError::DuplicateVersion {
                    version,
                    first: first.clone(),
                    second: path,
                });
            }
            debug!(file = %path.display(), version, tasks = change_set.tasks.len(), "loaded change-set");
            by_version.insert(version, (path, change_set));
        }

        Ok(by_version.into_values().map(|(_, cs)| cs).collect())
    }

    /// Highest version in the directory, 0 when there is none.
    pub fn latest_version(&self) -> Result<u64> {
        if !self.directory.exists() {
            return Ok(0);
        }
        Ok(self.load()?.last().map(|cs| cs.version).unwrap_or(0))
    }

    /// Change-set files in name order, so duplicate reports are stable.
    ///
    /// Symlinks are followed; a link whose target is missing is a parse
    /// error rather than a skipped file.
    fn candidate_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            let yaml = path
                .extension()
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !yaml || hidden {
                continue;
            }
            let metadata = fs::metadata(&path).map_err(|e| MigrationError::parse(&path, e))?;
            if metadata.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn parse_file(path: &Path) -> Result<ChangeSet> {
    let content = fs::read_to_string(path).map_err(|e| MigrationError::parse(path, e))?;
    serde_yaml::from_str(&content).map_err(|e| MigrationError::parse(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loader(dir: &TempDir) -> MigrationLoader {
        MigrationLoader::new(dir.path(), Span::none())
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_load_sorted_by_embedded_version() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.yaml", "version: 3\ntasks: []\n");
        write(&dir, "b.yml", "version: 1\ntasks:\n  - path: sys/auth/approle\n    method: read\n");
        write(&dir, "c.yaml", "version: 2\n");

        let sets = loader(&dir).load().unwrap();
        let versions: Vec<u64> = sets.iter().map(|cs| cs.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(sets[1].tasks.is_empty());
    }

    #[test]
    fn test_ignores_hidden_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "migration_001.yaml", "version: 1\n");
        write(&dir, ".state.yaml", "last_known_state: {}\n");
        write(&dir, "README.md", "# notes\n");
        fs::create_dir(dir.path().join("archive.yaml")).unwrap();

        assert_eq!(loader(&dir).load().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_version_names_both_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001_first.yaml", "version: 1\n");
        write(&dir, "001_second.yaml", "version: 1\n");

        match loader(&dir).load() {
            Err(MigrationError::DuplicateVersion { version, first, second }) => {
                assert_eq!(version, 1);
                assert!(first.ends_with("001_first.yaml"));
                assert!(second.ends_with("001_second.yaml"));
            }
            other => panic!("expected duplicate version error, got {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001.yaml", "version: 1\n");
        write(&dir, "002.yaml", "version: [oops\n");

        match loader(&dir).load() {
            Err(MigrationError::Parse { path, .. }) => assert!(path.ends_with("002.yaml")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_change_set_is_validation_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001.yaml", "version: 1\ntasks:\n  - path: secret/data/app\n    method: write\n");
        assert!(matches!(loader(&dir).load(), Err(MigrationError::Validation(_))));

        write(&dir, "001.yaml", "version: 0\n");
        assert!(matches!(loader(&dir).load(), Err(MigrationError::Validation(_))));
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let dir = TempDir::new().unwrap();
        let missing = MigrationLoader::new(dir.path().join("nope"), Span::none());
        assert!(matches!(missing.load(), Err(MigrationError::Config(_))));
        assert_eq!(missing.latest_version().unwrap(), 0);
    }

    #[test]
    fn test_latest_version() {
        let dir = TempDir::new().unwrap();
        assert_eq!(loader(&dir).latest_version().unwrap(), 0);
        write(&dir, "x.yaml", "version: 7\n");
        write(&dir, "y.yaml", "version: 4\n");
        assert_eq!(loader(&dir).latest_version().unwrap(), 7);
    }

    #[cfg(unix)]
    #[test]
    fn test_follows_symlinked_change_sets() {
        // Mounted config volumes expose each file as a link into a hidden dir
        let source = TempDir::new().unwrap();
        fs::write(
            source.path().join("m.yaml"),
            "version: 1\ntasks:\n  - path: sys/mounts/kv\n    method: write\n    data: {type: kv}\n",
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(source.path().join("m.yaml"), dir.path().join("001.yaml")).unwrap();

        let sets = loader(&dir).load().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].tasks[0].path, "sys/mounts/kv");
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_parse_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001.yaml", "version: 1\n");
        std::os::unix::fs::symlink(dir.path().join("gone.yaml"), dir.path().join("002.yaml")).unwrap();

        match loader(&dir).load() {
            Err(MigrationError::Parse { path, .. }) => assert!(path.ends_with("002.yaml")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
