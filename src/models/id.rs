//! Identifiers, entity kinds and cache scopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix that marks a client-generated placeholder ID.
pub const PENDING_PREFIX: &str = "tmp-";

/// Stable identifier of a cached entity.
///
/// Real IDs are whatever the server assigns. Pending IDs are minted locally
/// for entities whose create has not been acknowledged yet and always carry
/// [`PENDING_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh placeholder ID.
    pub fn pending() -> Self {
        Self(format!("{}{}", PENDING_PREFIX, Uuid::new_v4()))
    }

    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The resource types the engine caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Section,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Section => "section",
            EntityKind::Task => "task",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(EntityKind::Project),
            "section" => Ok(EntityKind::Section),
            "task" => Ok(EntityKind::Task),
            _ => Err(format!("Unknown entity kind: {}", s)),
        }
    }
}

/// Collection key used for projects, which all live under the account.
const ACCOUNT_COLLECTION: &str = "*";

/// A cacheable collection: one resource type under one parent.
///
/// Projects are cached as a single account-wide scope; tasks and sections
/// are cached per project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub kind: EntityKind,
    pub collection: String,
}

impl Scope {
    pub fn projects() -> Self {
        Self {
            kind: EntityKind::Project,
            collection: ACCOUNT_COLLECTION.to_string(),
        }
    }

    pub fn tasks(project_id: &EntityId) -> Self {
        Self {
            kind: EntityKind::Task,
            collection: project_id.to_string(),
        }
    }

    pub fn sections(project_id: &EntityId) -> Self {
        Self {
            kind: EntityKind::Section,
            collection: project_id.to_string(),
        }
    }

    /// The parent project, for per-project scopes.
    pub fn project_id(&self) -> Option<EntityId> {
        match self.kind {
            EntityKind::Project => None,
            EntityKind::Section | EntityKind::Task => Some(EntityId::new(&self.collection)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s/{}", self.kind, self.collection)
    }
}
