//! Change-set application.
//!
//! Tasks of one change-set are independent by authoring contract, so they
//! fan out onto a `JoinSet` and every one of them is drained before the
//! change-set reports back. Each task retries its store call with linear
//! backoff; the shared cancellation token stops new attempts and interrupts
//! in-flight calls and sleeps.

use crate::config::VaultConfig;
use crate::error::{MigrationError, Result, StoreError};
use crate::migration::{ChangeSet, Method, Task};
use crate::policy::PolicyTable;
use crate::store::{Store, StoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// How often and how patiently a task is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Attempt n waits n times this before the next one
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based), saturating
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt)
    }
}

impl From<&VaultConfig> for RetryPolicy {
    fn from(config: &VaultConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay)
    }
}

/// Applies change-sets against a store.
#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn Store>,
    policies: Arc<PolicyTable>,
    retry: RetryPolicy,
    concurrent: bool,
    span: Span,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn Store>, span: Span) -> Self {
        Self {
            store,
            policies: Arc::new(PolicyTable::default()),
            retry: RetryPolicy::default(),
            concurrent: true,
            span,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    /// Run tasks one after the other in file order instead of fanning out.
    pub fn sequential(mut self) -> Self {
        self.concurrent = false;
        self
    }

    /// Apply every task of `change_set`.
    ///
    /// Path policy is checked before anything is sent. Store errors carry
    /// the change-set version; when several tasks fail, the first failure
    /// collected is returned.
    pub async fn apply(
        &self,
        change_set: &ChangeSet,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let version = change_set.version;
        let span = info_span!(parent: &self.span, "apply", version);

        for task in &change_set.tasks {
            self.policies
                .check(task)
                .map_err(|e| with_version_prefix(e, version))?;
        }

        if dry_run {
            let _enter = span.enter();
            for (index, task) in change_set.tasks.iter().enumerate() {
                info!(task = index, path = %task.path, method = %task.method, "dry run: would execute task");
            }
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        span.in_scope(|| info!(tasks = change_set.tasks.len(), "applying change-set"));
        let started = Instant::now();

        let result = if self.concurrent {
            self.apply_concurrent(change_set, cancel, &span).await
        } else {
            self.apply_sequential(change_set, cancel, &span).await
        };

        match &result {
            Ok(()) => span.in_scope(|| {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "change-set applied")
            }),
            Err(e) => span.in_scope(|| error!(error = %e, "change-set failed")),
        }
        result.map_err(|e| e.in_version(version))
    }

    async fn apply_concurrent(
        &self,
        change_set: &ChangeSet,
        cancel: &CancellationToken,
        span: &Span,
    ) -> Result<()> {
        let mut units = JoinSet::new();
        let mut paths = HashMap::new();
        for (index, task) in change_set.tasks.iter().enumerate() {
            let unit = TaskUnit {
                store: Arc::clone(&self.store),
                task: task.clone(),
                retry: self.retry,
                cancel: cancel.clone(),
            };
            let task_span = task_span(span, index, task);
            let handle = units.spawn(unit.run().instrument(task_span));
            paths.insert(handle.id(), task.path.clone());
        }

        let mut first_failure = None;
        while let Some(joined) = units.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(MigrationError::TaskAborted {
                    version: None,
                    path: paths.remove(&e.id()).unwrap_or_default(),
                    reason: e.to_string(),
                }),
            };
            if let Err(e) = outcome {
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_sequential(
        &self,
        change_set: &ChangeSet,
        cancel: &CancellationToken,
        span: &Span,
    ) -> Result<()> {
        for (index, task) in change_set.tasks.iter().enumerate() {
            let unit = TaskUnit {
                store: Arc::clone(&self.store),
                task: task.clone(),
                retry: self.retry,
                cancel: cancel.clone(),
            };
            unit.run().instrument(task_span(span, index, task)).await?;
        }
        Ok(())
    }
}

fn task_span(parent: &Span, index: usize, task: &Task) -> Span {
    info_span!(parent: parent, "task", task = index, path = %task.path, method = %task.method)
}

fn with_version_prefix(err: MigrationError, version: u64) -> MigrationError {
    match err {
        MigrationError::Validation(msg) => {
            MigrationError::Validation(format!("version {}: {}", version, msg))
        }
        other => other,
    }
}

/// One task with everything it needs to run on its own.
struct TaskUnit {
    store: Arc<dyn Store>,
    task: Task,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl TaskUnit {
    async fn run(self) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let err = match self.call().await {
                Ok(()) => {
                    info!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task completed"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            if attempt >= self.retry.max_attempts {
                error!(error = %err, attempts = attempt, "task failed after retries");
                return Err(MigrationError::store(self.task.path.clone(), err));
            }

            let backoff = self.retry.backoff(attempt);
            warn!(error = %err, attempt, backoff_ms = backoff.as_millis() as u64, "task failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    async fn call(&self) -> StoreResult<()> {
        let store = &self.store;
        let path = self.task.path.as_str();
        let cancel = &self.cancel;

        let op = async {
            match (self.task.method, &self.task.data) {
                (Method::Read, _) => {
                    let found = store.read(path, cancel).await?;
                    debug!(found = found.is_some(), "read");
                    Ok(())
                }
                (Method::Write, Some(payload)) => store.write(path, payload, cancel).await,
                // Validated change-sets always carry data for writes
                (Method::Write, None) => Err(StoreError::Decode("write without data".to_string())),
                (Method::Delete, _) => store.delete(path, cancel).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Transport("request cancelled".to_string())),
            result = op => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PathPolicy;
    use crate::store::MemoryStore;
    use crate::value::{Payload, Value};

    fn payload() -> Payload {
        let mut p = Payload::new();
        p.insert("k".to_string(), Value::from("v1"));
        p
    }

    fn executor(store: &MemoryStore) -> TaskExecutor {
        TaskExecutor::new(Arc::new(store.clone()), Span::none())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
    }

    #[test]
    fn test_backoff_is_linear() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(2), Duration::from_secs(2));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_backoff_saturates() {
        let retry = RetryPolicy::new(3, Duration::MAX / 2);
        assert_eq!(retry.backoff(3), Duration::MAX);
    }

    #[tokio::test]
    async fn test_apply_writes_and_deletes() {
        let store = MemoryStore::new();
        store.insert("sys/policy/old", payload());
        let change_set = ChangeSet::new(
            1,
            vec![
                Task::write("secret/data/app", payload()),
                Task::delete("sys/policy/old"),
                Task::read("sys/auth"),
            ],
        );

        executor(&store)
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get("secret/data/app"), Some(payload()));
        assert!(!store.contains("sys/policy/old"));
        assert_eq!(store.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_contacts_nothing() {
        let store = MemoryStore::new();
        let change_set = ChangeSet::new(1, vec![Task::write("secret/data/app", payload())]);
        executor(&store)
            .apply(&change_set, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = MemoryStore::new();
        store.fail_times("secret/data/app", 2);
        let change_set = ChangeSet::new(1, vec![Task::write("secret/data/app", payload())]);

        executor(&store)
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.calls_to("secret/data/app"), 3);
    }

    #[tokio::test]
    async fn test_failure_drains_every_task() {
        let store = MemoryStore::new();
        store.fail_always("secret/data/broken");
        let change_set = ChangeSet::new(
            5,
            vec![
                Task::write("secret/data/broken", payload()),
                Task::write("secret/data/fine", payload()),
            ],
        );

        let err = executor(&store)
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            MigrationError::Store { version, path, .. } => {
                assert_eq!(version, Some(5));
                assert_eq!(path, "secret/data/broken");
            }
            other => panic!("expected store error, got {:?}", other),
        }
        assert_eq!(store.calls_to("secret/data/broken"), 3);
        assert!(store.contains("secret/data/fine"));
    }

    #[tokio::test]
    async fn test_failed_read_fails_change_set() {
        let store = MemoryStore::new();
        store.fail_always("sys/auth");
        let change_set = ChangeSet::new(
            2,
            vec![Task::read("sys/auth"), Task::write("sys/mounts/kv", payload())],
        );

        let err = executor(&store)
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Store { version: Some(2), ref path, .. } if path == "sys/auth"
        ));
        assert_eq!(store.calls_to("sys/auth"), 3);
        assert!(store.contains("sys/mounts/kv"));
    }

    /// Store whose writes to one path blow up inside the task
    struct PanickingStore {
        inner: MemoryStore,
        path: &'static str,
    }

    #[async_trait::async_trait]
    impl Store for PanickingStore {
        async fn read(&self, path: &str, cancel: &CancellationToken) -> StoreResult<Option<Payload>> {
            self.inner.read(path, cancel).await
        }

        async fn write(&self, path: &str, payload: &Payload, cancel: &CancellationToken) -> StoreResult<()> {
            if path == self.path {
                panic!("write to {path} exploded");
            }
            self.inner.write(path, payload, cancel).await
        }

        async fn delete(&self, path: &str, cancel: &CancellationToken) -> StoreResult<()> {
            self.inner.delete(path, cancel).await
        }
    }

    #[tokio::test]
    async fn test_panicking_task_reports_its_path() {
        let inner = MemoryStore::new();
        let store = PanickingStore {
            inner: inner.clone(),
            path: "sys/mounts/kv",
        };
        let change_set = ChangeSet::new(
            3,
            vec![
                Task::write("sys/mounts/kv", payload()),
                Task::write("sys/auth/approle", payload()),
            ],
        );

        let err = TaskExecutor::new(Arc::new(store), Span::none())
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            MigrationError::TaskAborted { version, path, reason } => {
                assert_eq!(version, Some(3));
                assert_eq!(path, "sys/mounts/kv");
                assert!(reason.contains("panic"), "reason: {reason}");
            }
            other => panic!("expected aborted task, got {:?}", other),
        }
        assert!(inner.contains("sys/auth/approle"));
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let store = MemoryStore::new();
        store.fail_always("sys/mounts/kv");
        let change_set = ChangeSet::new(
            1,
            vec![
                Task::write("sys/mounts/kv", payload()),
                Task::write("sys/auth/approle", payload()),
            ],
        );

        let result = executor(&store)
            .sequential()
            .apply(&change_set, false, &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(store.calls_to("sys/auth/approle"), 0);
    }

    #[tokio::test]
    async fn test_policy_violation_sends_nothing() {
        let store = MemoryStore::new();
        let policies = PolicyTable::new(vec![PathPolicy {
            prefix: "sys/health",
            wrapper: None,
            methods: &[Method::Read],
        }]);
        let change_set = ChangeSet::new(
            2,
            vec![
                Task::write("secret/data/app", payload()),
                Task::delete("sys/health"),
            ],
        );

        let err = executor(&store)
            .with_policies(policies)
            .apply(&change_set, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Validation(ref m) if m.starts_with("version 2:")));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_calls() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let change_set = ChangeSet::new(1, vec![Task::write("secret/data/app", payload())]);

        let err = executor(&store).apply(&change_set, false, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let store = MemoryStore::new();
        store.fail_always("secret/data/app");
        let cancel = CancellationToken::new();
        let exec = TaskExecutor::new(Arc::new(store.clone()), Span::none())
            .with_retry(RetryPolicy::new(3, Duration::from_secs(60)));
        let change_set = ChangeSet::new(1, vec![Task::write("secret/data/app", payload())]);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = exec.apply(&change_set, false, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.calls_to("secret/data/app"), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
