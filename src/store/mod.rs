//! Remote store capability.
//!
//! The engine only needs to read, write and delete a payload at a path.
//! Every call takes the run's cancellation token and must return promptly
//! once it fires. Implementations are shared between concurrent tasks
//! through `Arc<dyn Store>`.

pub mod memory;
pub mod vault;

use crate::error::StoreError;
use crate::value::Payload;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryStore;
pub use vault::VaultStore;

/// Outcome of a single store call.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Read the payload at `path`; `None` when nothing is stored there.
    async fn read(&self, path: &str, cancel: &CancellationToken) -> StoreResult<Option<Payload>>;

    /// Replace the payload at `path`.
    async fn write(&self, path: &str, payload: &Payload, cancel: &CancellationToken)
    -> StoreResult<()>;

    /// Remove whatever is stored at `path`.
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StoreResult<()>;
}
