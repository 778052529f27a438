//! Durable local cache: entities, the mutation log and freshness markers.

mod entity_store;
mod freshness;
mod mutation_log;

pub use freshness::{FreshnessMarker, FreshnessPolicy};
pub use mutation_log::{Flight, LocalChange, QueueCounts};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::models::EntityKind;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create database directory '{0}': {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Corrupt {what} in local store: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("{kind} {id} does not belong to scope {scope}")]
    ScopeMismatch {
        kind: EntityKind,
        id: String,
        scope: String,
    },

    #[error("Mutation {0} not found")]
    MutationNotFound(i64),
}

impl StoreError {
    fn corrupt(what: &'static str, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            what,
            reason: reason.to_string(),
        }
    }

    fn encode(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| StoreError::Encode { what, source }
    }
}

/// Open (creating if needed) the SQLite database and run migrations.
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::CreateDir(parent.to_path_buf(), e))?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);

    // One connection: every store operation and transaction is serialized.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// The local cache.
///
/// Every write the engine performs goes through one of these methods, each of
/// which is a single statement or a single transaction.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    policy: FreshnessPolicy,
}

impl LocalStore {
    pub fn new(pool: SqlitePool, policy: FreshnessPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn open(path: &Path, policy: FreshnessPolicy) -> Result<Self, StoreError> {
        let pool = init_db(path).await?;
        Ok(Self::new(pool, policy))
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }
}
