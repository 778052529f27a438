//! Todu Core Library
//!
//! Local-first task storage with a queued, conflict-aware sync engine.

pub mod db;
pub mod models;
pub mod remote;
pub mod sync;

pub use db::{init_db, LocalStore, StoreError};
pub use models::{EntityId, EntityKind, Project, Record, Scope, Section, Task};
pub use remote::{HttpRemote, RemoteClient, RemoteError};
pub use sync::{Repository, RepositoryOptions, SyncCoordinator, SyncError, SyncEvent};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
