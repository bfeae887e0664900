//! Migration engine: loader -> cursor -> executor, one version at a time.

use crate::config::{Config, TrackingBackend};
use crate::error::{MigrationError, Result};
use crate::executor::{RetryPolicy, TaskExecutor};
use crate::loader::MigrationLoader;
use crate::migration::ChangeSet;
use crate::store::Store;
use crate::tracker::{CursorLocation, VersionTracker};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info, info_span};

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    /// Cursor value read at start
    pub starting_version: u64,
    /// Cursor value at the end (unchanged in dry-run mode)
    pub final_version: u64,
    /// Versions applied, or that would have been in dry-run mode
    pub applied: Vec<u64>,
    /// Change-sets at or below the starting cursor
    pub skipped: usize,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_up_to_date(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies pending change-sets in version order.
pub struct MigrationEngine {
    loader: MigrationLoader,
    tracker: VersionTracker,
    executor: TaskExecutor,
    dry_run: bool,
    span: Span,
}

impl MigrationEngine {
    pub fn new(
        loader: MigrationLoader,
        tracker: VersionTracker,
        executor: TaskExecutor,
        dry_run: bool,
        span: Span,
    ) -> Self {
        Self {
            loader,
            tracker,
            executor,
            dry_run,
            span,
        }
    }

    /// Wire up every component from configuration.
    pub fn from_config(config: &Config, store: Arc<dyn Store>, span: Span) -> Self {
        let loader = MigrationLoader::new(
            &config.migrations.directory,
            info_span!(parent: &span, "loader"),
        );

        let location = match config.tracking.backend {
            TrackingBackend::Store => CursorLocation::Store {
                store: Arc::clone(&store),
                path: config.tracking.path.clone(),
            },
            TrackingBackend::File => CursorLocation::File(config.cursor_file()),
        };
        let tracker = VersionTracker::new(
            location,
            config.dry_run,
            info_span!(parent: &span, "tracker"),
        );

        let mut executor = TaskExecutor::new(store, info_span!(parent: &span, "executor"))
            .with_retry(RetryPolicy::from(&config.vault));
        if !config.migrations.concurrent_tasks {
            executor = executor.sequential();
        }

        Self::new(loader, tracker, executor, config.dry_run, span)
    }

    /// Change-sets newer than the recorded cursor, in application order.
    pub async fn pending(&self, cancel: &CancellationToken) -> Result<Vec<ChangeSet>> {
        let current = self.tracker.get(cancel).await?;
        Ok(self
            .loader
            .load()?
            .into_iter()
            .filter(|cs| cs.version > current)
            .collect())
    }

    /// Apply every pending change-set, stopping at the first failure.
    ///
    /// The cursor advances after each change-set whose tasks all succeeded,
    /// so a failed run leaves it at the last fully applied version.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.run_pending(cancel).instrument(self.span.clone()).await
    }

    async fn run_pending(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        info!(dry_run = self.dry_run, "starting migrations");

        let starting_version = self.tracker.get(cancel).await?;
        let change_sets = self.loader.load()?;

        let mut report = RunReport {
            starting_version,
            final_version: starting_version,
            dry_run: self.dry_run,
            ..RunReport::default()
        };

        for change_set in change_sets {
            let version = change_set.version;
            if version <= starting_version {
                report.skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            info!(version, tasks = change_set.tasks.len(), "applying migration");
            self.executor.apply(&change_set, self.dry_run, cancel).await?;
            self.tracker
                .set(version, cancel)
                .await
                .map_err(|e| e.in_version(version))?;

            if !self.dry_run {
                report.final_version = version;
            }
            report.applied.push(version);
            info!(version, "migration applied");
        }

        report.elapsed = started.elapsed();
        if report.is_up_to_date() {
            info!(version = report.final_version, "already up to date");
        } else {
            info!(
                applied = report.applied.len(),
                version = report.final_version,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "migrations completed"
            );
        }
        Ok(report)
    }
}
