use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use uuid::Uuid;

use super::{entity_store, LocalStore, StoreError};
use crate::models::{
    EntityId, EntityKind, Mutation, MutationStatus, NewMutation, Record, Scope, Snapshot,
};

/// A cache write that must land together with its mutation.
#[derive(Debug, Clone)]
pub enum LocalChange {
    Upsert(Record),
    Delete(EntityKind, EntityId),
    /// Temp-ID resolution: drop the placeholder row, store the server's copy.
    Resolve { pending_id: EntityId, record: Record },
}

impl LocalChange {
    pub fn scope(&self) -> Option<Scope> {
        match self {
            LocalChange::Upsert(record) | LocalChange::Resolve { record, .. } => {
                Some(record.scope())
            }
            LocalChange::Delete(..) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub flushing: u64,
    pub conflicted: u64,
}

/// Mutations claimed together for one batched request.
#[derive(Debug, Clone)]
pub struct Flight {
    pub id: Uuid,
    pub mutations: Vec<Mutation>,
}

#[derive(sqlx::FromRow)]
struct MutationRow {
    id: i64,
    entity_kind: String,
    entity_id: String,
    action: String,
    snapshot: Option<String>,
    conflict_base: Option<String>,
    status: String,
    idempotency_key: String,
    created_at: String,
    attempts: i64,
    note: Option<String>,
}

impl MutationRow {
    /// Payloads are decoded here, once, rather than at each use site.
    fn decode(self) -> Result<Mutation, StoreError> {
        let decode_snapshot = |raw: Option<String>| {
            raw.map(|s| Snapshot::decode(&s).map_err(|e| StoreError::corrupt("snapshot", e)))
                .transpose()
        };

        Ok(Mutation {
            id: self.id,
            kind: self
                .entity_kind
                .parse()
                .map_err(|e: String| StoreError::corrupt("mutation kind", e))?,
            entity_id: EntityId::new(self.entity_id),
            action: serde_json::from_str(&self.action)
                .map_err(|e| StoreError::corrupt("mutation action", e))?,
            snapshot: decode_snapshot(self.snapshot)?,
            conflict_base: decode_snapshot(self.conflict_base)?,
            status: self
                .status
                .parse()
                .map_err(|e: String| StoreError::corrupt("mutation status", e))?,
            idempotency_key: Uuid::parse_str(&self.idempotency_key)
                .map_err(|e| StoreError::corrupt("idempotency key", e))?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::corrupt("mutation timestamp", e))?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            note: self.note,
        })
    }
}

const SELECT_MUTATION: &str = "SELECT id, entity_kind, entity_id, action, snapshot, conflict_base, status, idempotency_key, created_at, attempts, note FROM mutations";

fn encode_snapshot(snapshot: Option<&Snapshot>) -> Result<Option<String>, StoreError> {
    snapshot
        .map(|s| s.encode().map_err(StoreError::encode("snapshot")))
        .transpose()
}

impl LocalStore {
    /// Append a mutation to the log; returns its ID.
    pub async fn enqueue_mutation(&self, mutation: &NewMutation) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_mutation(&mut conn, mutation).await
    }

    /// Apply an optimistic cache change and enqueue its mutation atomically.
    pub async fn apply_and_enqueue(
        &self,
        change: &LocalChange,
        mutation: &NewMutation,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        apply_change(&mut tx, change).await?;
        let id = insert_mutation(&mut tx, mutation).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// The oldest pending mutation, without claiming it.
    pub async fn next_pending_mutation(&self) -> Result<Option<Mutation>, StoreError> {
        let row: Option<MutationRow> = sqlx::query_as(&format!(
            "{} WHERE status = 'pending' ORDER BY id LIMIT 1",
            SELECT_MUTATION
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(MutationRow::decode).transpose()
    }

    /// Atomically pop the oldest pending mutation: mark it flushing and bump
    /// its attempt counter. Returns `None` if the queue has nothing pending
    /// or another mutation is already in flight.
    pub async fn claim_next_mutation(&self) -> Result<Option<Mutation>, StoreError> {
        let row: Option<MutationRow> = sqlx::query_as(
            r#"
            UPDATE mutations
            SET status = 'flushing', flight_id = ?, attempts = attempts + 1
            WHERE id = (SELECT id FROM mutations WHERE status = 'pending' ORDER BY id LIMIT 1)
              AND NOT EXISTS (SELECT 1 FROM mutations WHERE status = 'flushing')
            RETURNING id, entity_kind, entity_id, action, snapshot, conflict_base, status,
                      idempotency_key, created_at, attempts, note
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MutationRow::decode).transpose()
    }

    /// Claim up to `limit` oldest pending mutations as one flight: all of them
    /// go to `flushing` together and their attempt counters are bumped.
    /// Returns `None` if nothing is pending or another flight is in progress.
    pub async fn claim_batch(&self, limit: usize) -> Result<Option<Flight>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let busy: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM mutations WHERE status = 'flushing' LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        if busy.is_some() {
            return Ok(None);
        }

        let flight = Uuid::new_v4();
        let rows: Vec<MutationRow> = sqlx::query_as(
            r#"
            UPDATE mutations
            SET status = 'flushing', flight_id = ?, attempts = attempts + 1
            WHERE id IN (SELECT id FROM mutations WHERE status = 'pending' ORDER BY id LIMIT ?)
            RETURNING id, entity_kind, entity_id, action, snapshot, conflict_base, status,
                      idempotency_key, created_at, attempts, note
            "#,
        )
        .bind(flight.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut mutations = rows
            .into_iter()
            .map(MutationRow::decode)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        mutations.sort_by_key(|m| m.id);
        Ok(Some(Flight {
            id: flight,
            mutations,
        }))
    }

    /// Put the members of `flight` that are still in flight back in the
    /// queue. Returns how many were released.
    pub async fn release_flight(&self, flight: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE mutations SET status = 'pending', flight_id = NULL WHERE status = 'flushing' AND flight_id = ?",
        )
        .bind(flight.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_mutation_status(
        &self,
        id: i64,
        status: MutationStatus,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE mutations SET status = ?, note = ?, flight_id = NULL WHERE id = ?")
                .bind(status.as_str())
                .bind(note)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MutationNotFound(id));
        }
        Ok(())
    }

    /// Mark a mutation conflicted, remembering the server state it lost to,
    /// and apply `rollback` to the cache in the same transaction.
    pub async fn mark_conflicted(
        &self,
        id: i64,
        note: &str,
        server_state: Option<&Snapshot>,
        rollback: Option<&LocalChange>,
    ) -> Result<(), StoreError> {
        let base = encode_snapshot(server_state)?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET status = 'conflicted', note = ?, conflict_base = ?, flight_id = NULL
            WHERE id = ?
            "#,
        )
        .bind(note)
        .bind(base)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MutationNotFound(id));
        }
        if let Some(change) = rollback {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Put a mutation back in the queue with a new snapshot, clearing the
    /// conflict it was parked on, and re-apply its optimistic change.
    pub async fn requeue_mutation(
        &self,
        id: i64,
        snapshot: Option<&Snapshot>,
        change: Option<&LocalChange>,
    ) -> Result<(), StoreError> {
        let snapshot = encode_snapshot(snapshot)?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE mutations
            SET status = 'pending', note = NULL, conflict_base = NULL, snapshot = ?, flight_id = NULL
            WHERE id = ?
            "#,
        )
        .bind(snapshot)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MutationNotFound(id));
        }
        if let Some(change) = change {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a settled mutation and apply its final cache change atomically.
    pub async fn complete_mutation(
        &self,
        id: i64,
        change: Option<&LocalChange>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM mutations WHERE id = ? RETURNING entity_kind, entity_id",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((kind, entity_id)) = removed else {
            return Err(StoreError::MutationNotFound(id));
        };

        let kind: EntityKind = kind
            .parse()
            .map_err(|e: String| StoreError::corrupt("mutation kind", e))?;
        record_settlement(&mut tx, kind, &EntityId::new(entity_id)).await?;
        if let Some(LocalChange::Upsert(record) | LocalChange::Resolve { record, .. }) = change {
            record_settlement(&mut tx, record.kind(), record.id()).await?;
        }
        if let Some(change) = change {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// High-water mark of settled mutations, taken before listing a scope so
    /// the rebase can tell which entities changed while the list was out.
    pub async fn settlement_mark(&self) -> Result<i64, StoreError> {
        let (mark,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM settlements")
            .fetch_one(&self.pool)
            .await?;
        Ok(mark)
    }

    /// Remove a mutation that is not in flight and apply `change` in the same
    /// transaction. Returns `false` if it is gone or currently flushing.
    pub async fn discard_mutation(
        &self,
        id: i64,
        change: Option<&LocalChange>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM mutations WHERE id = ? AND status != 'flushing'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        if let Some(change) = change {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Whether a mutation queued after `id` targets the same entity.
    pub async fn has_later_mutations(
        &self,
        id: i64,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM mutations WHERE entity_kind = ? AND entity_id = ? AND id > ? LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(entity_id.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Returns whether a row was removed.
    pub async fn delete_mutation(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM mutations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_mutation(&self, id: i64) -> Result<Option<Mutation>, StoreError> {
        let row: Option<MutationRow> =
            sqlx::query_as(&format!("{} WHERE id = ?", SELECT_MUTATION))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(MutationRow::decode).transpose()
    }

    /// The whole log, oldest first.
    pub async fn list_mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        let rows: Vec<MutationRow> =
            sqlx::query_as(&format!("{} ORDER BY id", SELECT_MUTATION))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(MutationRow::decode).collect()
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM mutations GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => counts.pending = n,
                "flushing" => counts.flushing = n,
                "conflicted" => counts.conflicted = n,
                other => return Err(StoreError::corrupt("mutation status", other)),
            }
        }
        Ok(counts)
    }

    /// Return mutations left `flushing` by an interrupted run to the queue.
    pub async fn reset_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE mutations SET status = 'pending', flight_id = NULL WHERE status = 'flushing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn apply_change(conn: &mut SqliteConnection, change: &LocalChange) -> Result<(), StoreError> {
    match change {
        LocalChange::Upsert(record) => entity_store::upsert(conn, record).await,
        LocalChange::Delete(kind, id) => entity_store::delete(conn, *kind, id).await.map(|_| ()),
        LocalChange::Resolve { pending_id, record } => {
            entity_store::delete(conn, record.kind(), pending_id).await?;
            entity_store::upsert(conn, record).await
        }
    }
}

async fn insert_mutation(
    conn: &mut SqliteConnection,
    mutation: &NewMutation,
) -> Result<i64, StoreError> {
    let action = serde_json::to_string(&mutation.action).map_err(StoreError::encode("action"))?;
    let snapshot = encode_snapshot(mutation.snapshot.as_ref())?;

    let result = sqlx::query(
        r#"
        INSERT INTO mutations (entity_kind, entity_id, action, snapshot, status, idempotency_key, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(mutation.kind.as_str())
    .bind(mutation.entity_id.as_str())
    .bind(&action)
    .bind(snapshot)
    .bind(mutation.idempotency_key.to_string())
    .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn record_settlement(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &EntityId,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO settlements (entity_kind, entity_id, settled_at) VALUES (?, ?, ?)")
        .bind(kind.as_str())
        .bind(id.as_str())
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Entities of `kind` settled after `mark`.
pub(super) async fn settled_since(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    mark: i64,
) -> Result<HashSet<EntityId>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT entity_id FROM settlements WHERE entity_kind = ? AND seq > ?",
    )
    .bind(kind.as_str())
    .bind(mark)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(id,)| EntityId::new(id)).collect())
}

/// Forget settlements older than `age`; no listing is in flight that long.
pub(super) async fn prune_settlements(
    conn: &mut SqliteConnection,
    age: chrono::Duration,
) -> Result<(), StoreError> {
    let cutoff = Utc::now() - age;
    sqlx::query("DELETE FROM settlements WHERE settled_at < ?")
        .bind(cutoff.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Entities of `kind` that still have a mutation in the log, in any status.
pub(super) async fn outstanding_ids(
    conn: &mut SqliteConnection,
    kind: EntityKind,
) -> Result<HashSet<EntityId>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT entity_id FROM mutations WHERE entity_kind = ?")
            .bind(kind.as_str())
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows.into_iter().map(|(id,)| EntityId::new(id)).collect())
}
