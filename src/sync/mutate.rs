//! Optimistic writes and the user's side of conflict resolution.

use super::{Repository, SyncError};
use crate::db::LocalChange;
use crate::models::{
    Action, Entity, EntityId, EntityKind, Mutation, MutationStatus, NewMutation, Patch, Record,
    Snapshot, Task, ValidationError,
};

fn ensure_resolved(kind: EntityKind, id: &EntityId) -> Result<(), SyncError> {
    if id.is_pending() {
        return Err(SyncError::StillSyncing {
            kind,
            id: id.clone(),
        });
    }
    Ok(())
}

fn ensure_parents_resolved(parents: Vec<(EntityKind, &EntityId)>) -> Result<(), SyncError> {
    parents
        .into_iter()
        .try_for_each(|(kind, id)| ensure_resolved(kind, id))
}

fn with_checked(record: Record, checked: bool) -> Result<Record, SyncError> {
    match record {
        Record::Task(mut task) => {
            task.checked = checked;
            Ok(Record::Task(task))
        }
        other => Err(SyncError::NotATask(other.kind())),
    }
}

/// The cache change that undoes `mutation`'s optimistic edit.
pub(super) fn rollback_change(mutation: &Mutation) -> Option<LocalChange> {
    match &mutation.action {
        Action::Create(_) => Some(LocalChange::Delete(
            mutation.kind,
            mutation.entity_id.clone(),
        )),
        Action::Update(_) | Action::Close | Action::Reopen | Action::Delete => mutation
            .snapshot
            .as_ref()
            .map(|s| LocalChange::Upsert(s.record.clone())),
    }
}

impl Repository {
    /// Create `entity` locally under a fresh pending ID and queue it.
    ///
    /// Returns the entity as cached. Parents that are themselves still
    /// pending are refused.
    pub async fn create<E: Entity + Clone>(&self, entity: E) -> Result<E, SyncError> {
        let entity = entity.assign_id(EntityId::pending());
        let record = entity.clone().into_record();
        record.validate()?;
        ensure_parents_resolved(record.parents())?;

        let mutation = NewMutation::new(
            record.kind(),
            record.id().clone(),
            Action::Create(record.clone()),
        );
        self.commit(LocalChange::Upsert(record), mutation).await?;
        Ok(entity)
    }

    /// Apply `patch` to the cached entity and queue it. Returns the updated
    /// entity as the cache now holds it.
    pub async fn update(
        &self,
        id: &EntityId,
        patch: impl Into<Patch>,
    ) -> Result<Record, SyncError> {
        let patch = patch.into();
        let kind = patch.kind();
        ensure_resolved(kind, id)?;
        if patch.is_empty() {
            return Err(ValidationError::NoChanges.into());
        }
        ensure_parents_resolved(patch.parents())?;

        let current = self.cached_or_not_found(kind, id).await?;
        let updated = patch.apply(&current)?;

        let mutation = NewMutation::new(kind, id.clone(), Action::Update(patch))
            .with_snapshot(Some(Snapshot::capture(current)));
        self.commit(LocalChange::Upsert(updated.clone()), mutation)
            .await?;
        Ok(updated)
    }

    /// Mark a task done. It drops out of the active set immediately.
    pub async fn close_task(&self, id: &EntityId) -> Result<Task, SyncError> {
        self.set_checked(id, true, Action::Close).await
    }

    pub async fn reopen_task(&self, id: &EntityId) -> Result<Task, SyncError> {
        self.set_checked(id, false, Action::Reopen).await
    }

    pub async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<(), SyncError> {
        ensure_resolved(kind, id)?;
        let current = self.cached_or_not_found(kind, id).await?;

        let mutation = NewMutation::new(kind, id.clone(), Action::Delete)
            .with_snapshot(Some(Snapshot::capture(current)));
        self.commit(LocalChange::Delete(kind, id.clone()), mutation)
            .await?;
        Ok(())
    }

    /// Send a conflicted mutation again.
    ///
    /// The guard runs again and the optimistic change is re-applied. An
    /// update's snapshot moves to the server state it lost to, so the resend
    /// wins over that state.
    pub async fn retry(&self, id: i64) -> Result<(), SyncError> {
        let mutation = self.conflicted_mutation(id).await?;
        let kind = mutation.kind;

        let (change, snapshot) = match &mutation.action {
            Action::Create(record) => {
                ensure_parents_resolved(record.parents())?;
                (LocalChange::Upsert(record.clone()), None)
            }
            Action::Update(patch) => {
                ensure_resolved(kind, &mutation.entity_id)?;
                ensure_parents_resolved(patch.parents())?;
                let base = mutation
                    .conflict_base
                    .clone()
                    .or_else(|| mutation.snapshot.clone());
                let current = self.current_or_snapshot(&mutation, base.as_ref()).await?;
                (LocalChange::Upsert(patch.apply(&current)?), base)
            }
            Action::Close | Action::Reopen => {
                ensure_resolved(kind, &mutation.entity_id)?;
                let current = self
                    .current_or_snapshot(&mutation, mutation.snapshot.as_ref())
                    .await?;
                let checked = matches!(mutation.action, Action::Close);
                (
                    LocalChange::Upsert(with_checked(current, checked)?),
                    mutation.snapshot.clone(),
                )
            }
            Action::Delete => {
                ensure_resolved(kind, &mutation.entity_id)?;
                (
                    LocalChange::Delete(kind, mutation.entity_id.clone()),
                    mutation.snapshot.clone(),
                )
            }
        };

        self.store()
            .requeue_mutation(id, snapshot.as_ref(), Some(&change))
            .await?;
        tracing::info!("Re-queued mutation {} ({} {})", id, mutation.action, kind);
        Ok(())
    }

    /// Drop a mutation that is not in flight and put the cache back the way
    /// it was before the edit. The affected scope is revalidated on next read.
    pub async fn dismiss(&self, id: i64) -> Result<(), SyncError> {
        let mutation = self
            .store()
            .get_mutation(id)
            .await?
            .ok_or(SyncError::MutationNotFound(id))?;
        if mutation.status == MutationStatus::Flushing {
            return Err(SyncError::WrongStatus {
                id,
                status: mutation.status,
                expected: "pending or conflicted",
            });
        }

        let rollback = rollback_change(&mutation);
        if !self.store().discard_mutation(id, rollback.as_ref()).await? {
            // Claimed by a flush, or removed, since it was read.
            return Err(match self.store().get_mutation(id).await? {
                Some(current) => SyncError::WrongStatus {
                    id,
                    status: current.status,
                    expected: "pending or conflicted",
                },
                None => SyncError::MutationNotFound(id),
            });
        }
        if let Some(scope) = mutation.scope() {
            self.store().invalidate(&scope, None).await?;
        }
        tracing::info!("Dismissed mutation {} ({} {})", id, mutation.action, mutation.kind);
        Ok(())
    }

    async fn commit(&self, change: LocalChange, mutation: NewMutation) -> Result<i64, SyncError> {
        let id = self.store().apply_and_enqueue(&change, &mutation).await?;
        tracing::debug!(
            "Queued {} of {} {} as mutation {}",
            mutation.action,
            mutation.kind,
            mutation.entity_id,
            id
        );
        Ok(id)
    }

    async fn set_checked(
        &self,
        id: &EntityId,
        checked: bool,
        action: Action,
    ) -> Result<Task, SyncError> {
        ensure_resolved(EntityKind::Task, id)?;
        let current = self.cached_or_not_found(EntityKind::Task, id).await?;
        let updated = with_checked(current.clone(), checked)?;

        let mutation = NewMutation::new(EntityKind::Task, id.clone(), action)
            .with_snapshot(Some(Snapshot::capture(current)));
        self.commit(LocalChange::Upsert(updated.clone()), mutation)
            .await?;

        Task::from_record(updated).ok_or(SyncError::NotATask(EntityKind::Task))
    }

    async fn cached_or_not_found(&self, kind: EntityKind, id: &EntityId) -> Result<Record, SyncError> {
        self.store()
            .get_entity(kind, id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                kind,
                id: id.clone(),
            })
    }

    /// The cached entity, falling back to `snapshot` if a rollback or
    /// refresh removed it.
    async fn current_or_snapshot(
        &self,
        mutation: &Mutation,
        snapshot: Option<&Snapshot>,
    ) -> Result<Record, SyncError> {
        match self.store().get_entity(mutation.kind, &mutation.entity_id).await? {
            Some(record) => Ok(record),
            None => snapshot
                .map(|s| s.record.clone())
                .ok_or_else(|| SyncError::NotFound {
                    kind: mutation.kind,
                    id: mutation.entity_id.clone(),
                }),
        }
    }

    async fn conflicted_mutation(&self, id: i64) -> Result<Mutation, SyncError> {
        let mutation = self
            .store()
            .get_mutation(id)
            .await?
            .ok_or(SyncError::MutationNotFound(id))?;
        if !mutation.is_conflicted() {
            return Err(SyncError::WrongStatus {
                id,
                status: mutation.status,
                expected: "conflicted",
            });
        }
        Ok(mutation)
    }
}
