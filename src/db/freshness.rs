use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::time::Duration;

use super::{LocalStore, StoreError};
use crate::models::{EntityKind, Scope};

/// How long cached data of each kind is trusted without revalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    pub project_ttl: Duration,
    pub section_ttl: Duration,
    pub task_ttl: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            project_ttl: Duration::from_secs(300),
            section_ttl: Duration::from_secs(300),
            task_ttl: Duration::from_secs(60),
        }
    }
}

impl FreshnessPolicy {
    pub fn ttl(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Project => self.project_ttl,
            EntityKind::Section => self.section_ttl,
            EntityKind::Task => self.task_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessMarker {
    pub scope: Scope,
    /// `None` once the scope has been invalidated.
    pub refreshed_at: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MarkerRow {
    refreshed_at: Option<String>,
    cursor: Option<String>,
}

impl LocalStore {
    pub async fn marker(&self, scope: &Scope) -> Result<Option<FreshnessMarker>, StoreError> {
        let row: Option<MarkerRow> =
            sqlx::query_as("SELECT refreshed_at, cursor FROM freshness WHERE kind = ? AND scope = ?")
                .bind(scope.kind.as_str())
                .bind(&scope.collection)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let refreshed_at = row
            .refreshed_at
            .map(|at| {
                DateTime::parse_from_rfc3339(&at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::corrupt("freshness timestamp", e))
            })
            .transpose()?;

        Ok(Some(FreshnessMarker {
            scope: scope.clone(),
            refreshed_at,
            cursor: row.cursor,
        }))
    }

    /// True when the scope was never fetched, was invalidated, or has
    /// outlived its TTL.
    pub async fn is_stale(&self, scope: &Scope) -> Result<bool, StoreError> {
        let marker = self.marker(scope).await?;
        let Some(refreshed_at) = marker.and_then(|m| m.refreshed_at) else {
            return Ok(true);
        };

        let ttl = self.policy.ttl(scope.kind);
        // A timestamp in the future (clock moved back) counts as fresh.
        Ok(match (Utc::now() - refreshed_at).to_std() {
            Ok(age) => age > ttl,
            Err(_) => false,
        })
    }

    /// Force the next fetch of `scope` to revalidate. A supplied cursor
    /// replaces the stored one; otherwise the old cursor is kept.
    pub async fn invalidate(&self, scope: &Scope, cursor: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO freshness (kind, scope, refreshed_at, cursor)
            VALUES (?, ?, NULL, ?)
            ON CONFLICT(kind, scope) DO UPDATE SET
                refreshed_at = NULL,
                cursor = COALESCE(excluded.cursor, freshness.cursor)
            "#,
        )
        .bind(scope.kind.as_str())
        .bind(&scope.collection)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub(super) async fn mark_fresh(
    conn: &mut SqliteConnection,
    scope: &Scope,
    cursor: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO freshness (kind, scope, refreshed_at, cursor)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(kind, scope) DO UPDATE SET
            refreshed_at = excluded.refreshed_at,
            cursor = COALESCE(excluded.cursor, freshness.cursor)
        "#,
    )
    .bind(scope.kind.as_str())
    .bind(&scope.collection)
    .bind(Utc::now().to_rfc3339())
    .bind(cursor)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clear the scope's timestamp, keeping its cursor.
pub(super) async fn mark_stale(conn: &mut SqliteConnection, scope: &Scope) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO freshness (kind, scope, refreshed_at, cursor)
        VALUES (?, ?, NULL, NULL)
        ON CONFLICT(kind, scope) DO UPDATE SET refreshed_at = NULL
        "#,
    )
    .bind(scope.kind.as_str())
    .bind(&scope.collection)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
