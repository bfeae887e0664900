//! Version cursor.
//!
//! The cursor is the highest change-set version whose tasks all succeeded.
//! It lives either under a key in the store (`version` field, string
//! encoded, matching what earlier releases wrote) or in a small YAML file
//! when the store should not hold bookkeeping.
//!
//! Only the engine writes the cursor, once per fully applied change-set.

use crate::error::{MigrationError, Result};
use crate::store::Store;
use crate::value::{Payload, Value};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info};

const VERSION_FIELD: &str = "version";

/// Where the cursor is persisted
#[derive(Clone)]
pub enum CursorLocation {
    /// A key in the remote store
    Store { store: Arc<dyn Store>, path: String },
    /// A local YAML file
    File(PathBuf),
}

impl std::fmt::Debug for CursorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store { path, .. } => f.debug_struct("Store").field("path", path).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    version: u64,
}

/// Reads and records the last applied version.
#[derive(Debug, Clone)]
pub struct VersionTracker {
    location: CursorLocation,
    dry_run: bool,
    span: Span,
}

impl VersionTracker {
    pub fn new(location: CursorLocation, dry_run: bool, span: Span) -> Self {
        Self {
            location,
            dry_run,
            span,
        }
    }

    /// Last applied version; 0 when nothing was ever recorded.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<u64> {
        let version = match &self.location {
            CursorLocation::Store { store, path } => {
                let payload = store
                    .read(path, cancel)
                    .await
                    .map_err(|e| cancelled_or(cancel, MigrationError::store(path.clone(), e)))?;
                match payload {
                    Some(payload) => version_from_payload(path, &payload)?,
                    None => 0,
                }
            }
            CursorLocation::File(path) => read_cursor_file(path)?,
        };
        self.span.in_scope(|| debug!(version, "read version cursor"));
        Ok(version)
    }

    /// Record `version` as applied. No-op in dry-run mode.
    pub async fn set(&self, version: u64, cancel: &CancellationToken) -> Result<()> {
        if self.dry_run {
            self.span
                .in_scope(|| info!(version, "dry run: version cursor left unchanged"));
            return Ok(());
        }

        match &self.location {
            CursorLocation::Store { store, path } => {
                let mut payload = Payload::with_capacity(1);
                payload.insert(VERSION_FIELD.to_string(), Value::String(version.to_string()));
                store
                    .write(path, &payload, cancel)
                    .await
                    .map_err(|e| cancelled_or(cancel, MigrationError::store(path.clone(), e)))?;
            }
            CursorLocation::File(path) => write_cursor_file(path, version)?,
        }
        self.span.in_scope(|| debug!(version, "version cursor updated"));
        Ok(())
    }
}

fn cancelled_or(cancel: &CancellationToken, err: MigrationError) -> MigrationError {
    if cancel.is_cancelled() {
        MigrationError::Cancelled
    } else {
        err
    }
}

fn version_from_payload(path: &str, payload: &Payload) -> Result<u64> {
    let parsed = match payload.get(VERSION_FIELD) {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(Value::Integer(n)) => u64::try_from(*n).ok(),
        Some(_) => None,
    };
    parsed.ok_or_else(|| {
        MigrationError::parse(
            path,
            format!("invalid version format: {}", payload[VERSION_FIELD]),
        )
    })
}

fn read_cursor_file(path: &Path) -> Result<u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(0);
    }
    let cursor: CursorFile =
        serde_yaml::from_str(&content).map_err(|e| MigrationError::parse(path, e))?;
    Ok(cursor.version)
}

/// Write to a sibling temp file and rename, so a crash never leaves a
/// truncated cursor behind.
fn write_cursor_file(path: &Path, version: u64) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(&CursorFile { version })
        .map_err(|e| MigrationError::parse(path, e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, yaml)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
