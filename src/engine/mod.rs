//! Engine modules: applying change-sets and generating new ones.
//!
//! `runner` drives pending change-sets through the executor and owns the
//! version cursor. `diff` turns desired-state trees into new change-set
//! files for a later run.

pub mod diff;
pub mod runner;

pub use diff::{GenerateOutcome, StateDiffGenerator};
pub use runner::{MigrationEngine, RunReport};
