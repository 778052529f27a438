use chrono::Utc;
use sqlx::{Sqlite, SqliteConnection};
use std::collections::HashSet;

use super::{LocalStore, StoreError};
use crate::models::{EntityId, EntityKind, Record, Scope};

/// Minutes a settlement is remembered for rebasing listings.
const SETTLEMENT_RETENTION_MINUTES: i64 = 10;

#[derive(sqlx::FromRow)]
struct EntityRow {
    data: String,
}

impl EntityRow {
    fn decode(self) -> Result<Record, StoreError> {
        serde_json::from_str(&self.data).map_err(|e| StoreError::corrupt("entity", e))
    }
}

impl LocalStore {
    /// All cached entities of a scope, in the order they were stored.
    pub async fn get_entities(&self, scope: &Scope) -> Result<Vec<Record>, StoreError> {
        let rows: Vec<EntityRow> =
            sqlx::query_as("SELECT data FROM entities WHERE kind = ? AND scope = ? ORDER BY rowid")
                .bind(scope.kind.as_str())
                .bind(&scope.collection)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(EntityRow::decode).collect()
    }

    pub async fn get_entity(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<Record>, StoreError> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT data FROM entities WHERE kind = ? AND id = ?")
                .bind(kind.as_str())
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(EntityRow::decode).transpose()
    }

    pub async fn upsert_entity(&self, record: &Record) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, record).await
    }

    /// Returns whether a row was removed.
    pub async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        delete(&mut conn, kind, id).await
    }

    /// Overwrite a whole scope and mark it fresh, all in one transaction.
    pub async fn replace_entities(
        &self,
        scope: &Scope,
        items: &[Record],
        cursor: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        replace_scope(&mut tx, scope, items, &HashSet::new()).await?;
        super::freshness::mark_fresh(&mut tx, scope, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Like [`replace_entities`](Self::replace_entities), but entities with a
    /// mutation still in the log keep their local state (including being
    /// absent), so a refresh never undoes an edit that has not been delivered.
    ///
    /// `mark` is the [`settlement_mark`](Self::settlement_mark) taken before
    /// the listing was requested. Entities settled since then also keep their
    /// local state, and the scope is left stale because the listing predates
    /// them. Returns whether the scope was marked fresh.
    pub async fn rebase_entities(
        &self,
        scope: &Scope,
        items: &[Record],
        cursor: Option<&str>,
        mark: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut keep = super::mutation_log::outstanding_ids(&mut tx, scope.kind).await?;

        let settled = super::mutation_log::settled_since(&mut tx, scope.kind, mark).await?;
        let in_scope = scope_ids(&mut tx, scope).await?;
        let overtaken: Vec<EntityId> = settled
            .into_iter()
            .filter(|id| in_scope.contains(id) || items.iter().any(|item| item.id() == id))
            .collect();
        let fresh = overtaken.is_empty();
        keep.extend(overtaken);

        replace_scope(&mut tx, scope, items, &keep).await?;
        if fresh {
            super::freshness::mark_fresh(&mut tx, scope, cursor).await?;
        } else {
            super::freshness::mark_stale(&mut tx, scope).await?;
        }
        super::mutation_log::prune_settlements(
            &mut tx,
            chrono::Duration::minutes(SETTLEMENT_RETENTION_MINUTES),
        )
        .await?;
        tx.commit().await?;
        Ok(fresh)
    }
}

pub(super) async fn upsert(conn: &mut SqliteConnection, record: &Record) -> Result<(), StoreError> {
    let data = serde_json::to_string(record).map_err(StoreError::encode("entity"))?;
    let scope = record.scope();

    sqlx::query(
        r#"
        INSERT INTO entities (kind, id, scope, data, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(kind, id) DO UPDATE SET
            scope = excluded.scope,
            data = excluded.data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(record.kind().as_str())
    .bind(record.id().as_str())
    .bind(&scope.collection)
    .bind(&data)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(super) async fn delete(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &EntityId,
) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM entities WHERE kind = ? AND id = ?")
        .bind(kind.as_str())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn scope_ids(
    conn: &mut SqliteConnection,
    scope: &Scope,
) -> Result<HashSet<EntityId>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM entities WHERE kind = ? AND scope = ?")
            .bind(scope.kind.as_str())
            .bind(&scope.collection)
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows.into_iter().map(|(id,)| EntityId::new(id)).collect())
}

async fn replace_scope(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    scope: &Scope,
    items: &[Record],
    keep: &HashSet<EntityId>,
) -> Result<(), StoreError> {
    for item in items {
        if item.kind() != scope.kind || item.scope() != *scope {
            return Err(StoreError::ScopeMismatch {
                kind: item.kind(),
                id: item.id().to_string(),
                scope: scope.to_string(),
            });
        }
    }

    for id in scope_ids(tx, scope).await? {
        if !keep.contains(&id) {
            delete(tx, scope.kind, &id).await?;
        }
    }

    for item in items.iter().filter(|item| !keep.contains(item.id())) {
        upsert(tx, item).await?;
    }

    Ok(())
}
