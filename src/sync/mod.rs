//! Sync engine
//!
//! Offline-first synchronization between the local cache store and a
//! remote mail provider:
//! - `job` / `dispatcher`: priority-ordered, per-account serial execution
//! - `gatekeeper`: last-moment veto predicates (connectivity, cache pressure)
//! - `producer`: background tasks that feed the dispatcher
//! - `mutations`: durable FIFO pipeline for user-initiated writes
//! - `eviction`: cache budget enforcement
//! - `lifecycle`: active/passive cadence control
//! - `engine`: the facade the host application uses

use thiserror::Error;

use crate::db::DbError;
use crate::remote::RemoteError;

pub mod dispatcher;
pub mod engine;
pub mod eviction;
pub mod gatekeeper;
pub mod job;
pub mod lifecycle;
pub mod mutations;
pub mod producer;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

pub use dispatcher::{AccountStatus, Dispatcher};
pub use engine::SyncEngine;
pub use job::{Job, JobKind};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use mutations::{DraftContent, MutationStats, PendingMutation, UploadOutcome};

/// Engine-level error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("remote provider error: {0}")]
    Remote(#[from] RemoteError),

    #[error("entity not found: {0}")]
    MissingEntity(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
