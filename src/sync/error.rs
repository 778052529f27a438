use thiserror::Error;

use crate::db::StoreError;
use crate::models::{EntityId, EntityKind, MutationStatus, ValidationError};
use crate::remote::RemoteError;

/// Errors surfaced by [`Repository`](super::Repository) to its callers.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{kind} {id} is still syncing; try again once the server has accepted it")]
    StillSyncing { kind: EntityKind, id: EntityId },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("Invalid change: {0}")]
    InvalidChange(#[from] ValidationError),

    #[error("Tasks can be closed and reopened, {0}s cannot")]
    NotATask(EntityKind),

    #[error("Mutation {0} not found")]
    MutationNotFound(i64),

    #[error("Mutation {id} is {status}, expected {expected}")]
    WrongStatus {
        id: i64,
        status: MutationStatus,
        expected: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
