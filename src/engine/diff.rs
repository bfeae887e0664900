//! State diff generator.
//!
//! Compares a current tree (live store contents, or the last-known snapshot)
//! with the desired tree and writes the smallest change-set that moves one
//! to the other.
//!
//! # Rules
//!
//! | Current        | Desired          | Task                |
//! |----------------|------------------|---------------------|
//! | absent         | value            | write               |
//! | value          | different value  | write               |
//! | value          | same value       | none                |
//! | value          | absent or null   | delete              |
//!
//! Writes come first in path order, deletes follow in path order. Values are
//! compared through their canonical form after stripping the container key
//! the path policy wraps payloads in (`secret/data/*` stores `{data: ...}`).

use crate::error::{MigrationError, Result};
use crate::loader::MigrationLoader;
use crate::migration::{ChangeSet, Task};
use crate::policy::PolicyTable;
use crate::schema::{self, StateTree};
use crate::store::Store;
use crate::value::{Payload, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info};

/// Key a non-mapping desired value is stored under
const SCALAR_KEY: &str = "value";

// ============================================================================
// Outcome
// ============================================================================

/// Result of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateOutcome {
    /// Current and desired state already agree; nothing was written
    NoOp,
    /// A new change-set file was written
    Generated {
        version: u64,
        file: PathBuf,
        change_set: ChangeSet,
    },
}

impl GenerateOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Produces change-set files from desired-state trees.
#[derive(Debug, Clone)]
pub struct StateDiffGenerator {
    directory: PathBuf,
    policies: PolicyTable,
    span: Span,
}

impl StateDiffGenerator {
    pub fn new(directory: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            directory: directory.into(),
            policies: PolicyTable::default(),
            span,
        }
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Tasks that turn `current` into `desired`. No I/O.
    pub fn plan(&self, current: &StateTree, desired: &StateTree) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();

        for (path, wanted) in desired {
            if wanted.is_null() {
                continue;
            }
            let policy = self.policies.lookup(path);
            let payload = write_payload(wanted);

            if let Some(existing) = current.get(path) {
                let unwrapped = policy.unwrap_value(existing);
                // A scalar read back from the store comes as `{value: ...}`
                if existing.canonical_eq(wanted)
                    || unwrapped.canonical_eq(wanted)
                    || unwrapped.canonical_eq(&Value::Mapping(payload.clone()))
                {
                    continue;
                }
            }
            tasks.push(Task::write(path.clone(), policy.wrap(payload)));
        }

        for path in current.keys() {
            let gone = desired.get(path).map(Value::is_null).unwrap_or(true);
            if gone {
                tasks.push(Task::delete(path.clone()));
            }
        }

        for task in &tasks {
            self.policies.check(task)?;
        }
        Ok(tasks)
    }

    /// Diff `desired` against `current` (or the snapshot when `current` is
    /// `None`) and write the next change-set plus a fresh snapshot.
    pub fn generate(
        &self,
        current: Option<StateTree>,
        desired: &StateTree,
    ) -> Result<GenerateOutcome> {
        let _enter = self.span.enter();
        fs::create_dir_all(&self.directory)?;

        let current = match current {
            Some(tree) => tree,
            None => match schema::load_snapshot(&self.directory)? {
                Some(snapshot) => {
                    debug!(paths = snapshot.len(), "diffing against last known state");
                    snapshot
                }
                None => {
                    info!("no current or last known state, generating full migration");
                    StateTree::new()
                }
            },
        };

        let tasks = self.plan(&current, desired)?;
        if tasks.is_empty() {
            info!("no migrations required, configurations are identical");
            return Ok(GenerateOutcome::NoOp);
        }

        let loader = MigrationLoader::new(&self.directory, self.span.clone());
        let version = loader.latest_version()? + 1;
        let change_set = ChangeSet::new(version, tasks);
        change_set.validate()?;

        let file = self.directory.join(format!("migration_{:03}.yaml", version));
        write_new_file(&file, &change_set)?;
        schema::save_snapshot(&self.directory, desired)?;

        info!(
            version,
            tasks = change_set.tasks.len(),
            file = %file.display(),
            "generated migration"
        );
        Ok(GenerateOutcome::Generated {
            version,
            file,
            change_set,
        })
    }

    /// Read each of `paths` from the store into a tree. Paths with nothing
    /// stored are left out.
    pub async fn observe<I, S>(
        &self,
        store: &dyn Store,
        paths: I,
        cancel: &CancellationToken,
    ) -> Result<StateTree>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = StateTree::new();
        for path in paths {
            let path = path.as_ref();
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            let found = store.read(path, cancel).await.map_err(|e| {
                if cancel.is_cancelled() {
                    MigrationError::Cancelled
                } else {
                    MigrationError::store(path, e)
                }
            })?;
            if let Some(payload) = found {
                tree.insert(path.to_string(), Value::Mapping(payload));
            }
        }
        self.span
            .in_scope(|| debug!(present = tree.len(), "observed live state"));
        Ok(tree)
    }
}

/// Mappings are written as they are; anything else under `value`.
fn write_payload(value: &Value) -> Payload {
    match value {
        Value::Mapping(map) => map.clone(),
        other => {
            let mut payload = Payload::with_capacity(1);
            payload.insert(SCALAR_KEY.to_string(), other.clone());
            payload
        }
    }
}

fn write_new_file(path: &Path, change_set: &ChangeSet) -> Result<()> {
    let yaml = serde_yaml::to_string(change_set).map_err(|e| MigrationError::parse(path, e))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    std::io::Write::write_all(&mut file, yaml.as_bytes())?;
    Ok(())
}
