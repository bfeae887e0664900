//! In-process store.
//!
//! Backs the test suite and offline experiments. Supports fault injection
//! per path and keeps a call log so callers can assert exactly what reached
//! the store.

use super::{Store, StoreResult};
use crate::error::StoreError;
use crate::migration::Method;
use crate::value::Payload;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Fault {
    Times(usize),
    Always,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<String, Payload>,
    faults: HashMap<String, Fault>,
    calls: Vec<(Method, String)>,
    mutations: usize,
}

/// Thread-safe in-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (cancellable), to exercise timing paths.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a value without counting it as a mutation.
    pub fn insert(&self, path: impl Into<String>, payload: Payload) {
        self.lock().data.insert(path.into(), payload);
    }

    pub fn get(&self, path: &str) -> Option<Payload> {
        self.lock().data.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().data.contains_key(path)
    }

    /// Fail the next `times` calls against `path`.
    pub fn fail_times(&self, path: impl Into<String>, times: usize) {
        self.lock().faults.insert(path.into(), Fault::Times(times));
    }

    /// Fail every call against `path`.
    pub fn fail_always(&self, path: impl Into<String>) {
        self.lock().faults.insert(path.into(), Fault::Always);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of successful writes and deletes.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// Every call attempted so far, including failed ones, in arrival order.
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.lock().calls.clone()
    }

    /// Number of calls attempted against `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.lock().calls.iter().filter(|(_, p)| p == path).count()
    }

    /// Copy of every stored path and payload.
    pub fn snapshot(&self) -> BTreeMap<String, Payload> {
        self.lock().data.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the store from the others
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self, cancel: &CancellationToken) -> StoreResult<()> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StoreError::Transport("request cancelled".to_string()));
                }
                _ = tokio::time::sleep(latency) => {}
            }
        }
        Ok(())
    }

    /// Record the call and consume one injected fault, if any.
    fn begin(&self, method: Method, path: &str) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push((method, path.to_string()));
        let fault = inner.faults.get(path).copied();
        match fault {
            Some(Fault::Always) => Err(StoreError::Injected(path.to_string())),
            Some(Fault::Times(n)) if n > 0 => {
                if n == 1 {
                    inner.faults.remove(path);
                } else {
                    inner.faults.insert(path.to_string(), Fault::Times(n - 1));
                }
                Err(StoreError::Injected(path.to_string()))
            }
            _ => Ok(inner),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &str, cancel: &CancellationToken) -> StoreResult<Option<Payload>> {
        self.simulate_latency(cancel).await?;
        let inner = self.begin(Method::Read, path)?;
        Ok(inner.data.get(path).cloned())
    }

    async fn write(
        &self,
        path: &str,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.simulate_latency(cancel).await?;
        let mut inner = self.begin(Method::Write, path)?;
        inner.data.insert(path.to_string(), payload.clone());
        inner.mutations += 1;
        Ok(())
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StoreResult<()> {
        self.simulate_latency(cancel).await?;
        let mut inner = self.begin(Method::Delete, path)?;
        inner.data.remove(path);
        inner.mutations += 1;
        Ok(())
    }
}
