//! Change-set and task types.
//!
//! A change-set file looks like:
//! ```yaml
//! version: 3
//! tasks:
//!   - path: secret/data/app
//!     method: write
//!     data:
//!       data:
//!         api_key: abc123
//!   - path: sys/policy/legacy
//!     method: delete
//! ```

use crate::error::{MigrationError, Result};
use crate::value::Payload;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use strum::{Display, EnumString};

/// Store operation performed by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    Read,
    /// Older generators emitted HTTP verbs for writes
    #[serde(alias = "post", alias = "put", alias = "POST", alias = "PUT")]
    Write,
    #[serde(alias = "DELETE")]
    Delete,
}

impl Method {
    /// Whether a successful call changes remote state
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Write | Self::Delete)
    }
}

/// A single operation against one store path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub path: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl Task {
    pub fn read(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::Read,
            data: None,
        }
    }

    pub fn write(path: impl Into<String>, data: Payload) -> Self {
        Self {
            path: path.into(),
            method: Method::Write,
            data: Some(data),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: Method::Delete,
            data: None,
        }
    }

    /// Payload presence must match the method, and the path must be usable.
    pub fn validate(&self) -> Result<()> {
        let path = self.path.trim();
        if path.is_empty() {
            return Err(MigrationError::validation("task path must not be empty"));
        }
        if path.starts_with('/') {
            return Err(MigrationError::validation(format!(
                "task path '{}' must be relative (no leading '/')",
                self.path
            )));
        }
        match (self.method, &self.data) {
            (Method::Write, None) => Err(MigrationError::validation(format!(
                "write to '{}' requires data",
                self.path
            ))),
            (Method::Read | Method::Delete, Some(_)) => Err(MigrationError::validation(format!(
                "{} of '{}' must not carry data",
                self.method, self.path
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// One versioned batch of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub version: u64,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl ChangeSet {
    pub fn new(version: u64, tasks: Vec<Task>) -> Self {
        Self { version, tasks }
    }

    /// Structural checks that do not depend on path policy.
    ///
    /// Tasks in one change-set run concurrently, so the same (path, method)
    /// pair may appear only once.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(MigrationError::validation(
                "migration version must be a positive integer",
            ));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            task.validate()
                .map_err(|e| prefix_version(e, self.version))?;
            if !seen.insert((task.path.as_str(), task.method)) {
                return Err(MigrationError::validation(format!(
                    "version {}: duplicate task '{}'",
                    self.version, task
                )));
            }
        }
        Ok(())
    }

    /// Number of tasks that change remote state
    pub fn mutation_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.method.is_mutation()).count()
    }
}

fn prefix_version(err: MigrationError, version: u64) -> MigrationError {
    match err {
        MigrationError::Validation(msg) => {
            MigrationError::Validation(format!("version {}: {}", version, msg))
        }
        other => other,
    }
}
