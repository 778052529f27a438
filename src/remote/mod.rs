//! The server side of sync: the [`RemoteClient`] seam and its error taxonomy.

pub mod http;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Action, EntityId, EntityKind, Patch, Record, Scope};

pub use http::HttpRemote;
#[cfg(test)]
pub use memory::MemoryRemote;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rejected by server: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unexpected response from server: {0}")]
    Protocol(String),

    #[error("Server does not support batched sync")]
    BatchUnsupported,
}

/// How the flush loop treats a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The target is gone; the mutation counts as delivered.
    NotFound,
    /// Try again later with the same idempotency key.
    Transient,
    /// Will never succeed as sent.
    Permanent,
}

impl RemoteError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            RemoteError::NotFound(_) => ErrorClass::NotFound,
            RemoteError::RateLimited { .. }
            | RemoteError::Server { .. }
            | RemoteError::Network(_)
            | RemoteError::Timeout
            | RemoteError::Protocol(_) => ErrorClass::Transient,
            RemoteError::Validation(_)
            | RemoteError::Forbidden(_)
            | RemoteError::BatchUnsupported => ErrorClass::Permanent,
        }
    }
}

/// One page of a scope, as the server sees it.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<Record>,
    pub cursor: Option<String>,
}

/// A queued mutation as sent in a batch.
#[derive(Debug, Clone)]
pub struct BatchCommand {
    pub idempotency_key: Uuid,
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub action: Action,
}

impl BatchCommand {
    /// The temp ID the server should map, for creates.
    pub fn placeholder(&self) -> Option<&EntityId> {
        match self.action {
            Action::Create(_) => Some(&self.entity_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    /// Keyed by idempotency key. Commands missing here were not processed.
    pub statuses: HashMap<Uuid, Result<(), RemoteError>>,
    pub placeholder_ids: HashMap<EntityId, EntityId>,
    pub cursor: Option<String>,
}

/// Entity CRUD against the server.
///
/// Every mutating call carries the mutation's idempotency key; sending the
/// same key twice must not apply the change twice.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list(&self, scope: &Scope) -> Result<Listing, RemoteError>;

    async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Record, RemoteError>;

    /// Returns the created entity under its server-assigned ID.
    async fn create(&self, record: &Record, key: Uuid) -> Result<Record, RemoteError>;

    /// Returns the server-canonical entity after the update.
    async fn update(&self, id: &EntityId, patch: &Patch, key: Uuid)
        -> Result<Record, RemoteError>;

    async fn close(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError>;

    async fn reopen(&self, id: &EntityId, key: Uuid) -> Result<(), RemoteError>;

    async fn delete(&self, kind: EntityKind, id: &EntityId, key: Uuid)
        -> Result<(), RemoteError>;

    fn supports_batch(&self) -> bool {
        false
    }

    async fn submit_batch(&self, _commands: &[BatchCommand]) -> Result<BatchResponse, RemoteError> {
        Err(RemoteError::BatchUnsupported)
    }
}

/// Stand-in used when no server is configured: every call fails as a
/// network error, so edits stay queued until sync is set up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

impl Offline {
    fn error() -> RemoteError {
        RemoteError::Network("sync is not configured".to_string())
    }
}

#[async_trait]
impl RemoteClient for Offline {
    async fn list(&self, _scope: &Scope) -> Result<Listing, RemoteError> {
        Err(Self::error())
    }

    async fn get(&self, _kind: EntityKind, _id: &EntityId) -> Result<Record, RemoteError> {
        Err(Self::error())
    }

    async fn create(&self, _record: &Record, _key: Uuid) -> Result<Record, RemoteError> {
        Err(Self::error())
    }

    async fn update(
        &self,
        _id: &EntityId,
        _patch: &Patch,
        _key: Uuid,
    ) -> Result<Record, RemoteError> {
        Err(Self::error())
    }

    async fn close(&self, _id: &EntityId, _key: Uuid) -> Result<(), RemoteError> {
        Err(Self::error())
    }

    async fn reopen(&self, _id: &EntityId, _key: Uuid) -> Result<(), RemoteError> {
        Err(Self::error())
    }

    async fn delete(
        &self,
        _kind: EntityKind,
        _id: &EntityId,
        _key: Uuid,
    ) -> Result<(), RemoteError> {
        Err(Self::error())
    }
}
