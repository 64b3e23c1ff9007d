//! mailsync - offline-first mail synchronization engine
//!
//! Local SQLite cache as the single source of truth for the UI, with a
//! priority dispatcher reconciling it against a remote provider behind the
//! `RemoteMailService` boundary. User writes apply locally first and drain
//! through a durable mutation queue; downloads compete under a cache
//! budget enforced by gatekeepers and eviction.

pub mod config;
pub mod db;
pub mod remote;
pub mod sync;

pub use config::EngineConfig;
pub use db::Database;
pub use remote::{RemoteError, RemoteMailService};
pub use sync::{AccountStatus, DraftContent, SyncEngine};
