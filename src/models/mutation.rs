//! Queued local edits awaiting delivery to the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::id::{EntityId, EntityKind, Scope};
use super::record::{Patch, Record};

/// Current layout of [`Snapshot`]. Bump when the serialized shape changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// What a queued mutation asks the server to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "args", rename_all = "snake_case")]
pub enum Action {
    /// Create the carried entity; its ID is the placeholder to resolve.
    Create(Record),
    Update(Patch),
    Close,
    Reopen,
    Delete,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Update(_) => "update",
            Action::Close => "close",
            Action::Reopen => "reopen",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Flushing,
    Conflicted,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Flushing => "flushing",
            MutationStatus::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "flushing" => Ok(MutationStatus::Flushing),
            "conflicted" => Ok(MutationStatus::Conflicted),
            _ => Err(format!("Unknown mutation status: {}", s)),
        }
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Unsupported snapshot version {0}, expected {}", SNAPSHOT_VERSION)]
    Version(u32),

    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Entity state captured when a local edit was made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub version: u32,
    pub captured_at: DateTime<Utc>,
    pub record: Record,
}

impl Snapshot {
    pub fn capture(record: Record) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            captured_at: Utc::now(),
            record,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        Ok(snapshot)
    }
}

/// A mutation about to be appended to the log.
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub action: Action,
    pub snapshot: Option<Snapshot>,
    pub idempotency_key: Uuid,
}

impl NewMutation {
    pub fn new(kind: EntityKind, entity_id: EntityId, action: Action) -> Self {
        Self {
            kind,
            entity_id,
            action,
            snapshot: None,
            idempotency_key: Uuid::new_v4(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<Snapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// A mutation as stored in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub id: i64,
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub action: Action,
    pub snapshot: Option<Snapshot>,
    /// Server state observed when the mutation was marked conflicted.
    pub conflict_base: Option<Snapshot>,
    pub status: MutationStatus,
    pub idempotency_key: Uuid,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub note: Option<String>,
}

impl Mutation {
    pub fn is_conflicted(&self) -> bool {
        self.status == MutationStatus::Conflicted
    }

    /// The cached scope this mutation touches, when it can be told.
    pub fn scope(&self) -> Option<Scope> {
        match &self.action {
            Action::Create(record) => Some(record.scope()),
            _ => self
                .snapshot
                .as_ref()
                .or(self.conflict_base.as_ref())
                .map(|s| s.record.scope()),
        }
    }
}
