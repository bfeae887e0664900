//! Vault Migrations Library
//!
//! Versioned, repeatable configuration changes for HashiCorp Vault: load
//! change-sets, apply the pending ones in order while tracking progress, and
//! generate new change-sets from a desired-state tree.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod loader;
pub mod logging;
pub mod migration;
pub mod policy;
pub mod schema;
pub mod shutdown;
pub mod store;
pub mod tracker;
pub mod value;

// Re-export main types for convenience
pub use config::{Config, MigrationsConfig, TrackingBackend, TrackingConfig, VaultConfig};
pub use engine::{GenerateOutcome, MigrationEngine, RunReport, StateDiffGenerator};
pub use error::{MigrationError, Result, StoreError};
pub use executor::{RetryPolicy, TaskExecutor};
pub use loader::MigrationLoader;
pub use migration::{ChangeSet, Method, Task};
pub use policy::{PathPolicy, PolicyTable};
pub use schema::StateTree;
pub use store::{MemoryStore, Store, VaultStore};
pub use tracker::{CursorLocation, VersionTracker};
pub use value::{Payload, Value};
