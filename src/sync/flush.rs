//! Delivering the mutation log to the server.

use super::conflict;
use super::mutate::rollback_change;
use super::{Repository, SyncError, SyncEvent};
use crate::db::{LocalChange, StoreError};
use crate::models::{Action, Mutation, MutationStatus, Patch, Record, Snapshot};
use crate::remote::{ErrorClass, RemoteError};

/// What one flush achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub conflicted: usize,
    /// Left pending after a transient failure.
    pub deferred: usize,
    /// Another flush was already running; nothing was done.
    pub busy: bool,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.conflicted == 0 && self.deferred == 0
    }

    pub(super) fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Delivered => self.delivered += 1,
            FlushOutcome::Conflicted => self.conflicted += 1,
            FlushOutcome::Deferred => self.deferred += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Applied on the server (or already gone there); removed from the log.
    Delivered,
    /// Parked until the user retries or dismisses it.
    Conflicted,
    /// Back to pending; will be sent again.
    Deferred,
}

/// How a delivered mutation should land locally.
pub(super) enum Settlement {
    Done(Option<LocalChange>),
    Conflict { note: String, server: Record },
}

impl Repository {
    /// Deliver pending mutations oldest first until the log is empty or a
    /// transient failure stops the drain.
    ///
    /// Only one flush runs at a time; a call made while another is running
    /// returns at once with `busy` set.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            tracing::debug!("Flush already running");
            return Ok(FlushReport {
                busy: true,
                ..Default::default()
            });
        };

        let report = if self.batching() {
            self.flush_batch_locked().await?
        } else {
            self.drain_locked().await?
        };

        if !report.is_empty() {
            tracing::info!(
                "Flushed: {} delivered, {} conflicted, {} deferred",
                report.delivered,
                report.conflicted,
                report.deferred
            );
            self.emit(SyncEvent::Flushed(report));
        }
        Ok(report)
    }

    /// Deliver the oldest pending mutation only. `None` when there was
    /// nothing to send or a flush is already running.
    pub async fn flush_one(&self) -> Result<Option<FlushOutcome>, SyncError> {
        let Ok(_guard) = self.inner.flush_lock.try_lock() else {
            return Ok(None);
        };
        self.flush_next_locked().await
    }

    async fn drain_locked(&self) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();
        while let Some(outcome) = self.flush_next_locked().await? {
            report.record(outcome);
            if outcome == FlushOutcome::Deferred {
                // Keep FIFO: nothing overtakes a mutation waiting to retry.
                break;
            }
        }
        Ok(report)
    }

    async fn flush_next_locked(&self) -> Result<Option<FlushOutcome>, SyncError> {
        let Some(mutation) = self.store().claim_next_mutation().await? else {
            return Ok(None);
        };
        tracing::debug!(
            "Flushing mutation {} ({} {} {}, attempt {})",
            mutation.id,
            mutation.action,
            mutation.kind,
            mutation.entity_id,
            mutation.attempts
        );

        let delivery = self.deliver(&mutation).await;
        match self.settle(&mutation, delivery).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                // Never leave a mutation stuck in flight.
                if let Err(revert) = self
                    .store()
                    .update_mutation_status(mutation.id, MutationStatus::Pending, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(
                        "Could not return mutation {} to the queue: {}",
                        mutation.id,
                        revert
                    );
                }
                Err(e)
            }
        }
    }

    async fn deliver(&self, mutation: &Mutation) -> Result<Settlement, RemoteError> {
        let remote = &self.inner.remote;
        let key = mutation.idempotency_key;
        let id = &mutation.entity_id;

        match &mutation.action {
            Action::Create(record) => {
                let created = remote.create(record, key).await?;
                Ok(Settlement::Done(Some(LocalChange::Resolve {
                    pending_id: id.clone(),
                    record: created,
                })))
            }
            Action::Update(patch) => {
                let server = remote.get(mutation.kind, id).await?;
                if let Some(note) = update_conflict(mutation, &server, patch) {
                    return Ok(Settlement::Conflict { note, server });
                }
                let canonical = remote.update(id, patch, key).await?;
                Ok(Settlement::Done(Some(LocalChange::Upsert(canonical))))
            }
            Action::Close => {
                remote.close(id, key).await?;
                Ok(Settlement::Done(None))
            }
            Action::Reopen => {
                remote.reopen(id, key).await?;
                Ok(Settlement::Done(None))
            }
            Action::Delete => {
                remote.delete(mutation.kind, id, key).await?;
                Ok(Settlement::Done(None))
            }
        }
    }

    /// Record the result of one delivery in the store.
    pub(super) async fn settle(
        &self,
        mutation: &Mutation,
        delivery: Result<Settlement, RemoteError>,
    ) -> Result<FlushOutcome, SyncError> {
        let store = self.store();

        match delivery {
            Ok(Settlement::Done(change)) => {
                // A later edit to the same entity owns the cached value now.
                let superseded = matches!(change, Some(LocalChange::Upsert(_)))
                    && store
                        .has_later_mutations(mutation.id, mutation.kind, &mutation.entity_id)
                        .await?;
                let change = if superseded { None } else { change };
                settled_elsewhere(
                    store.complete_mutation(mutation.id, change.as_ref()).await,
                    mutation.id,
                )?;
                tracing::debug!("Delivered mutation {}", mutation.id);
                Ok(FlushOutcome::Delivered)
            }
            Ok(Settlement::Conflict { note, server }) => {
                tracing::warn!("Mutation {} conflicts with the server: {}", mutation.id, note);
                settled_elsewhere(
                    store
                        .mark_conflicted(mutation.id, &note, Some(&Snapshot::capture(server)), None)
                        .await,
                    mutation.id,
                )?;
                self.emit_conflict(mutation, note);
                Ok(FlushOutcome::Conflicted)
            }
            Err(error) => match error.classify() {
                ErrorClass::NotFound => {
                    tracing::info!(
                        "{} {} is gone on the server; dropping mutation {}",
                        mutation.kind,
                        mutation.entity_id,
                        mutation.id
                    );
                    // A create the server refuses to find leaves nothing to
                    // resolve its placeholder; drop it with the mutation.
                    let rollback = match mutation.action {
                        Action::Create(_) => rollback_change(mutation),
                        _ => None,
                    };
                    settled_elsewhere(
                        store.complete_mutation(mutation.id, rollback.as_ref()).await,
                        mutation.id,
                    )?;
                    Ok(FlushOutcome::Delivered)
                }
                ErrorClass::Transient => {
                    tracing::warn!(
                        "Mutation {} will be retried (attempt {}): {}",
                        mutation.id,
                        mutation.attempts,
                        error
                    );
                    settled_elsewhere(
                        store
                            .update_mutation_status(
                                mutation.id,
                                MutationStatus::Pending,
                                Some(&error.to_string()),
                            )
                            .await,
                        mutation.id,
                    )?;
                    Ok(FlushOutcome::Deferred)
                }
                ErrorClass::Permanent => {
                    tracing::warn!("Mutation {} rejected: {}", mutation.id, error);
                    let note = error.to_string();
                    let rollback = rollback_change(mutation);
                    settled_elsewhere(
                        store
                            .mark_conflicted(mutation.id, &note, None, rollback.as_ref())
                            .await,
                        mutation.id,
                    )?;
                    self.emit_conflict(mutation, note);
                    Ok(FlushOutcome::Conflicted)
                }
            },
        }
    }

    fn emit_conflict(&self, mutation: &Mutation, message: String) {
        self.emit(SyncEvent::Conflict {
            mutation_id: mutation.id,
            kind: mutation.kind,
            entity_id: mutation.entity_id.clone(),
            message,
        });
    }
}

/// A mutation that left the log while in flight has nothing to settle.
fn settled_elsewhere(result: Result<(), StoreError>, id: i64) -> Result<(), StoreError> {
    match result {
        Err(StoreError::MutationNotFound(_)) => {
            tracing::debug!("Mutation {} left the log while in flight", id);
            Ok(())
        }
        other => other,
    }
}

/// Conflict check for a queued update against the server's current state.
///
/// On a resend the earlier attempt may have landed with its response lost;
/// a server that already holds every requested value is then not a conflict.
pub(super) fn update_conflict(mutation: &Mutation, server: &Record, patch: &Patch) -> Option<String> {
    let snapshot = mutation.snapshot.as_ref()?;
    if mutation.attempts > 1 && patch.apply(server).ok().as_ref() == Some(server) {
        return None;
    }
    conflict::detect(&snapshot.record, server, patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Entity, EntityId, EntityKind, FieldUpdate, Project, Scope, Task, TaskPatch,
    };
    use crate::remote::memory::Op;
    use crate::remote::MemoryRemote;
    use crate::sync::test_support::{setup_repo, TestContext};
    use std::time::Duration;

    fn inbox_id() -> EntityId {
        EntityId::new("P1")
    }

    fn t1() -> Task {
        Task::new(inbox_id(), "Buy milk").with_id("T1")
    }

    /// A task both the server and the cache already know.
    async fn with_known_task(remote: MemoryRemote) -> TestContext {
        let ctx = setup_repo(remote).await;
        ctx.remote.seed(Project::new("Inbox").with_id("P1"));
        ctx.remote.seed(t1());
        ctx.repo.refresh(&Scope::tasks(&inbox_id())).await.unwrap();
        ctx
    }

    async fn cached(ctx: &TestContext, id: &str) -> Option<Task> {
        ctx.repo
            .get_cached_entity(EntityKind::Task, &EntityId::new(id))
            .await
            .unwrap()
            .and_then(Task::from_record)
    }

    fn priority(p: u8) -> TaskPatch {
        TaskPatch {
            priority: FieldUpdate::Set(p),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_resolves_temp_id() {
        let ctx = setup_repo(MemoryRemote::new()).await;
        let task = ctx
            .repo
            .create(Task::new(inbox_id(), "Buy milk"))
            .await
            .unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert!(cached(&ctx, task.id.as_str()).await.is_none());
        let all = ctx.repo.get_cached(&Scope::tasks(&inbox_id())).await.unwrap();
        assert_eq!(all.len(), 1);
        let resolved = Task::from_record(all[0].clone()).unwrap();
        assert_eq!(resolved.id, EntityId::new("T100"));
        assert_eq!(resolved.content, "Buy milk");
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_update_takes_server_copy() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        // Someone else edits a field this update does not touch.
        ctx.remote.edit(EntityKind::Task, &EntityId::new("T1"), |r| {
            if let Record::Task(t) = r {
                t.description = "from the shop on the corner".into();
            }
        });
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        let task = cached(&ctx, "T1").await.unwrap();
        assert_eq!(task.priority, 4);
        assert_eq!(task.description, "from the shop on the corner");
        assert_eq!(
            Record::from(task),
            ctx.remote.record(EntityKind::Task, &EntityId::new("T1")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_diverged_update_conflicts_and_keeps_local_value() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote.edit(EntityKind::Task, &EntityId::new("T1"), |r| {
            if let Record::Task(t) = r {
                t.priority = 3;
            }
        });
        let mut events = ctx.repo.subscribe();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.conflicted, 1);
        let queue = ctx.repo.mutations().await.unwrap();
        assert!(queue[0].is_conflicted());
        assert_eq!(
            queue[0].note.as_deref(),
            Some("priority: you changed 1→4, server has 3")
        );
        assert_eq!(cached(&ctx, "T1").await.unwrap().priority, 4);
        assert_eq!(ctx.remote.calls(Op::Update), 0);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_retry_after_conflict_wins() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote.edit(EntityKind::Task, &EntityId::new("T1"), |r| {
            if let Record::Task(t) = r {
                t.priority = 3;
            }
        });
        ctx.repo.flush().await.unwrap();
        let id = ctx.repo.mutations().await.unwrap()[0].id;

        ctx.repo.retry(id).await.unwrap();
        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        let server = ctx.remote.record(EntityKind::Task, &EntityId::new("T1")).unwrap();
        assert_eq!(Task::from_record(server).unwrap().priority, 4);
    }

    #[tokio::test]
    async fn test_close_not_found_is_silent_success() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        ctx.remote
            .fail_next(Op::Close, RemoteError::NotFound("task T1".into()));

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicted, 0);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        assert!(!cached(&ctx, "T1").await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_create_not_found_drops_placeholder() {
        let ctx = setup_repo(MemoryRemote::new()).await;
        let task = ctx
            .repo
            .create(Task::new(inbox_id(), "Buy milk"))
            .await
            .unwrap();
        ctx.remote
            .fail_next(Op::Create, RemoteError::NotFound("project P1".into()));

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        assert!(cached(&ctx, task.id.as_str()).await.is_none());
        assert!(ctx
            .repo
            .get_cached(&Scope::tasks(&inbox_id()))
            .await
            .unwrap()
            .is_empty());
    }

    fn conflict_events(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> usize {
        let mut conflicts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::Conflict { .. }) {
                conflicts += 1;
            }
        }
        conflicts
    }

    #[tokio::test]
    async fn test_update_of_task_gone_before_check_is_dropped() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote
            .fail_next(Op::Get, RemoteError::NotFound("task T1".into()));
        let mut events = ctx.repo.subscribe();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicted, 0);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        assert_eq!(ctx.remote.calls(Op::Update), 0);
        assert_eq!(conflict_events(&mut events), 0);
    }

    #[tokio::test]
    async fn test_update_of_task_gone_on_write_is_dropped() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote
            .fail_next(Op::Update, RemoteError::NotFound("task T1".into()));
        let mut events = ctx.repo.subscribe();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicted, 0);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        assert_eq!(ctx.remote.calls(Op::Update), 1);
        assert_eq!(conflict_events(&mut events), 0);
    }

    #[tokio::test]
    async fn test_reopen_is_delivered() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        assert_eq!(ctx.repo.flush().await.unwrap().delivered, 1);

        ctx.repo.reopen_task(&EntityId::new("T1")).await.unwrap();
        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(ctx.remote.calls(Op::Reopen), 1);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        let server = ctx.remote.record(EntityKind::Task, &EntityId::new("T1")).unwrap();
        assert!(Task::from_record(server).unwrap().is_active());
        assert!(cached(&ctx, "T1").await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_delete_is_delivered() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo
            .delete(EntityKind::Task, &EntityId::new("T1"))
            .await
            .unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(ctx.remote.calls(Op::Delete), 1);
        assert!(ctx.remote.record(EntityKind::Task, &EntityId::new("T1")).is_none());
        assert!(cached(&ctx, "T1").await.is_none());
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_stops_drain_in_order() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        ctx.repo
            .create(Task::new(inbox_id(), "Buy bread"))
            .await
            .unwrap();
        ctx.remote.fail_next(Op::Close, RemoteError::Timeout);

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(ctx.remote.calls(Op::Create), 0);
        let queue = ctx.repo.mutations().await.unwrap();
        assert!(queue.iter().all(|m| m.status == MutationStatus::Pending));
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(queue[0].note.as_deref(), Some("Request timed out"));

        let report = ctx.repo.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_rolls_back() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote
            .fail_next(Op::Update, RemoteError::Forbidden("read-only".into()));

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.conflicted, 1);
        assert_eq!(cached(&ctx, "T1").await.unwrap().priority, 1);
        let queue = ctx.repo.mutations().await.unwrap();
        assert!(queue[0].is_conflicted());
        assert_eq!(queue[0].note.as_deref(), Some("Forbidden: read-only"));
    }

    #[tokio::test]
    async fn test_rejected_create_removes_placeholder() {
        let ctx = setup_repo(MemoryRemote::new()).await;
        let task = ctx
            .repo
            .create(Task::new(inbox_id(), "Buy milk"))
            .await
            .unwrap();
        ctx.remote
            .fail_next(Op::Create, RemoteError::Validation("no such project".into()));

        ctx.repo.flush().await.unwrap();

        assert!(cached(&ctx, task.id.as_str()).await.is_none());
        assert!(ctx.repo.mutations().await.unwrap()[0].is_conflicted());
    }

    #[tokio::test]
    async fn test_dismiss_conflicted_close_restores_task() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        let before = cached(&ctx, "T1").await.unwrap();
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        ctx.remote
            .fail_next(Op::Close, RemoteError::Forbidden("archived".into()));
        ctx.repo.flush().await.unwrap();
        let id = ctx.repo.mutations().await.unwrap()[0].id;

        ctx.repo.dismiss(id).await.unwrap();

        let after = cached(&ctx, "T1").await.unwrap();
        assert!(after.is_active());
        assert_eq!(after, before);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_response_is_applied_once() {
        let ctx = setup_repo(MemoryRemote::new()).await;
        ctx.repo
            .create(Task::new(inbox_id(), "Buy milk"))
            .await
            .unwrap();
        ctx.remote.fail_after_apply(Op::Create, RemoteError::Timeout);

        assert_eq!(ctx.repo.flush().await.unwrap().deferred, 1);
        assert_eq!(ctx.repo.flush().await.unwrap().delivered, 1);

        assert_eq!(ctx.remote.effects(), 1);
        assert_eq!(ctx.remote.records().len(), 1);
        assert_eq!(
            ctx.repo.get_cached(&Scope::tasks(&inbox_id())).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_lost_update_response_does_not_conflict_on_resend() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(4)).await.unwrap();
        ctx.remote.fail_after_apply(Op::Update, RemoteError::Timeout);

        assert_eq!(ctx.repo.flush().await.unwrap().deferred, 1);
        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(ctx.remote.effects(), 1);
    }

    #[tokio::test]
    async fn test_later_edit_is_not_clobbered() {
        let ctx = with_known_task(MemoryRemote::new()).await;
        ctx.repo.update(&EntityId::new("T1"), priority(2)).await.unwrap();
        ctx.repo.update(&EntityId::new("T1"), priority(3)).await.unwrap();

        assert_eq!(ctx.repo.flush_one().await.unwrap(), Some(FlushOutcome::Delivered));

        assert_eq!(cached(&ctx, "T1").await.unwrap().priority, 3);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_are_single_flight() {
        let ctx = setup_repo(MemoryRemote::new().with_latency(Duration::from_millis(20))).await;
        for content in ["one", "two", "three"] {
            ctx.repo
                .create(Task::new(inbox_id(), content))
                .await
                .unwrap();
        }

        let repo = ctx.repo.clone();
        let fetch_scope = Scope::tasks(&inbox_id());
        let (a, b, c, _) = tokio::join!(
            ctx.repo.flush(),
            repo.flush(),
            ctx.repo.flush_one(),
            ctx.repo.fetch(&fetch_scope)
        );

        let reports = [a.unwrap(), b.unwrap()];
        assert_eq!(reports.iter().filter(|r| r.busy).count(), 1);
        assert_eq!(c.unwrap(), None);
        assert_eq!(ctx.remote.calls(Op::Create), 3);
        assert_eq!(ctx.remote.effects(), 3);
        let ids: Vec<String> = ctx
            .remote
            .records()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["T100", "T101", "T102"]);
    }

    #[tokio::test]
    async fn test_interrupted_flush_is_recovered_on_open() {
        let ctx = setup_repo(MemoryRemote::new()).await;
        ctx.repo
            .create(Task::new(inbox_id(), "Buy milk"))
            .await
            .unwrap();
        ctx.repo.store().claim_next_mutation().await.unwrap().unwrap();

        let reopened = ctx.reopen().await;

        assert_eq!(reopened.queue_counts().await.unwrap().pending, 1);
        assert_eq!(reopened.flush().await.unwrap().delivered, 1);
    }
}
