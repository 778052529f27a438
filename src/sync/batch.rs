//! Sending several queued mutations in one request.
//!
//! Each mutation in the batch is settled by the same rules as a single
//! delivery; the batch only changes how they travel.

use std::collections::BTreeSet;

use super::flush::{update_conflict, FlushOutcome, FlushReport, Settlement};
use super::{Repository, SyncError};
use crate::db::LocalChange;
use crate::models::{Action, Mutation, Record, Scope};
use crate::remote::{BatchCommand, BatchResponse, RemoteError};

impl Repository {
    pub(super) fn batching(&self) -> bool {
        self.inner.options.batch_size > 0 && self.inner.remote.supports_batch()
    }

    pub(super) async fn flush_batch_locked(&self) -> Result<FlushReport, SyncError> {
        let Some(flight) = self
            .store()
            .claim_batch(self.inner.options.batch_size)
            .await?
        else {
            return Ok(FlushReport::default());
        };

        let result = self.send_flight(flight.mutations).await;

        // Members held back after a deferral, or left unsettled by an error,
        // go back to the queue in their original order.
        let released = self.store().release_flight(flight.id).await;
        match (result, released) {
            (Ok(report), Ok(released)) => {
                if released > 0 {
                    tracing::debug!("Returned {} unsent mutation(s) to the queue", released);
                }
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(release)) => {
                tracing::warn!("Could not release flight {}: {}", flight.id, release);
                Err(e)
            }
        }
    }

    async fn send_flight(&self, batch: Vec<Mutation>) -> Result<FlushReport, SyncError> {
        let mut report = FlushReport::default();

        // Updates are conflict-checked against the server before anything
        // is sent; a conflicted update stays out of the batch.
        let mut ready: Vec<(Mutation, Option<Record>)> = Vec::with_capacity(batch.len());
        for mutation in batch {
            let Action::Update(patch) = &mutation.action else {
                ready.push((mutation, None));
                continue;
            };

            match self.inner.remote.get(mutation.kind, &mutation.entity_id).await {
                Ok(server) => match update_conflict(&mutation, &server, patch) {
                    Some(note) => {
                        let outcome = self
                            .settle(&mutation, Ok(Settlement::Conflict { note, server }))
                            .await?;
                        report.record(outcome);
                    }
                    None => ready.push((mutation, Some(server))),
                },
                Err(e) => {
                    let outcome = self.settle(&mutation, Err(e)).await?;
                    report.record(outcome);
                    if outcome == FlushOutcome::Deferred {
                        // Later mutations wait their turn.
                        break;
                    }
                }
            }
        }

        if ready.is_empty() {
            return Ok(report);
        }

        let commands: Vec<BatchCommand> = ready
            .iter()
            .map(|(m, _)| BatchCommand {
                idempotency_key: m.idempotency_key,
                kind: m.kind,
                entity_id: m.entity_id.clone(),
                action: m.action.clone(),
            })
            .collect();
        tracing::debug!("Submitting {} mutation(s) as one batch", commands.len());

        let response = match self.inner.remote.submit_batch(&commands).await {
            Ok(response) => response,
            Err(e) => {
                for (mutation, _) in &ready {
                    report.record(self.settle(mutation, Err(e.clone())).await?);
                }
                return Ok(report);
            }
        };

        let mut touched = BTreeSet::new();
        for (mutation, server) in ready {
            let delivery = match response.statuses.get(&mutation.idempotency_key) {
                Some(Ok(())) => batch_settlement(&mutation, server, &response),
                Some(Err(e)) => Err(e.clone()),
                None => Err(RemoteError::Protocol(format!(
                    "no status for mutation {}",
                    mutation.id
                ))),
            };
            if let Ok(Settlement::Done(Some(change))) = &delivery {
                touched.extend(change.scope());
            }
            report.record(self.settle(&mutation, delivery).await?);
        }

        // What the server has now is newer than any cached scope we wrote to.
        for scope in &touched {
            self.invalidate_with_cursor(scope, response.cursor.as_deref())
                .await?;
        }

        Ok(report)
    }

    async fn invalidate_with_cursor(
        &self,
        scope: &Scope,
        cursor: Option<&str>,
    ) -> Result<(), SyncError> {
        Ok(self.store().invalidate(scope, cursor).await?)
    }
}

fn batch_settlement(
    mutation: &Mutation,
    server: Option<Record>,
    response: &BatchResponse,
) -> Result<Settlement, RemoteError> {
    match &mutation.action {
        Action::Create(record) => {
            let real_id = response
                .placeholder_ids
                .get(&mutation.entity_id)
                .ok_or_else(|| {
                    RemoteError::Protocol(format!("no ID assigned to {}", mutation.entity_id))
                })?;
            Ok(Settlement::Done(Some(LocalChange::Resolve {
                pending_id: mutation.entity_id.clone(),
                record: record.clone().with_id(real_id.clone()),
            })))
        }
        // The batch reply carries no entities; the pre-fetched server copy
        // with the patch applied is what the server now holds.
        Action::Update(patch) => Ok(Settlement::Done(
            server
                .and_then(|s| patch.apply(&s).ok())
                .map(LocalChange::Upsert),
        )),
        Action::Close | Action::Reopen | Action::Delete => Ok(Settlement::Done(None)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use uuid::Uuid;

    use crate::models::{
        Entity, EntityId, EntityKind, FieldUpdate, MutationStatus, Project, Record, Scope, Task,
        TaskPatch,
    };
    use crate::remote::memory::Op;
    use crate::remote::{MemoryRemote, RemoteClient, RemoteError};
    use crate::sync::test_support::{setup_repo_with, TestContext};
    use crate::sync::{FlushReport, RepositoryOptions, SyncError};

    fn inbox_id() -> EntityId {
        EntityId::new("P1")
    }

    async fn batched(batch_size: usize) -> TestContext {
        let ctx = setup_repo_with(
            MemoryRemote::new().with_batch(),
            RepositoryOptions { batch_size },
        )
        .await;
        ctx.remote.seed(Project::new("Inbox").with_id("P1"));
        ctx.remote.seed(Task::new(inbox_id(), "Buy milk").with_id("T1"));
        ctx.repo.refresh(&Scope::tasks(&inbox_id())).await.unwrap();
        ctx
    }

    /// Two queued creates and a flush already waiting on the batch reply.
    async fn batch_in_flight() -> (
        TestContext,
        tokio::task::JoinHandle<Result<FlushReport, SyncError>>,
    ) {
        let ctx = setup_repo_with(
            MemoryRemote::new()
                .with_batch()
                .with_latency(Duration::from_millis(50)),
            RepositoryOptions { batch_size: 10 },
        )
        .await;
        ctx.repo.create(Task::new(inbox_id(), "one")).await.unwrap();
        ctx.repo.create(Task::new(inbox_id(), "two")).await.unwrap();

        let repo = ctx.repo.clone();
        let flush = tokio::spawn(async move { repo.flush().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (ctx, flush)
    }

    #[tokio::test]
    async fn test_batch_delivers_in_one_request() {
        let ctx = batched(10).await;
        let created = ctx
            .repo
            .create(Task::new(inbox_id(), "Buy bread"))
            .await
            .unwrap();
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(ctx.remote.calls(Op::Batch), 1);
        assert_eq!(ctx.remote.calls(Op::Create), 0);
        assert!(ctx
            .repo
            .get_cached_entity(EntityKind::Task, &created.id)
            .await
            .unwrap()
            .is_none());
        let resolved = ctx
            .repo
            .get_cached_entity(EntityKind::Task, &EntityId::new("T100"))
            .await
            .unwrap()
            .and_then(Task::from_record)
            .unwrap();
        assert_eq!(resolved.content, "Buy bread");
        assert!(ctx.repo.is_stale(&Scope::tasks(&inbox_id())).await.unwrap());
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_respects_size() {
        let ctx = batched(1).await;
        ctx.repo.create(Task::new(inbox_id(), "one")).await.unwrap();
        ctx.repo.create(Task::new(inbox_id(), "two")).await.unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(ctx.repo.mutations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_per_command_status_is_honoured() {
        let ctx = batched(10).await;
        ctx.remote.seed(Task::new(inbox_id(), "Old errand").with_id("T2"));
        ctx.repo.refresh(&Scope::tasks(&inbox_id())).await.unwrap();
        ctx.repo.close_task(&EntityId::new("T2")).await.unwrap();
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        // Someone else deleted T2 in the meantime.
        ctx.remote
            .delete(EntityKind::Task, &EntityId::new("T2"), Uuid::new_v4())
            .await
            .unwrap();

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.delivered, 2);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        match ctx.remote.record(EntityKind::Task, &EntityId::new("T1")) {
            Some(Record::Task(t)) => assert!(t.checked),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflicted_update_stays_out_of_batch() {
        let ctx = batched(10).await;
        let patch = TaskPatch {
            priority: FieldUpdate::Set(4),
            ..Default::default()
        };
        ctx.repo.update(&EntityId::new("T1"), patch).await.unwrap();
        ctx.repo
            .create(Task::new(inbox_id(), "Buy bread"))
            .await
            .unwrap();
        ctx.remote.edit(EntityKind::Task, &EntityId::new("T1"), |r| {
            if let Record::Task(t) = r {
                t.priority = 3;
            }
        });

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.conflicted, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(ctx.remote.calls(Op::Update), 0);
        let queue = ctx.repo.mutations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, MutationStatus::Conflicted);
    }

    #[tokio::test]
    async fn test_transient_batch_failure_keeps_everything_pending() {
        let ctx = batched(10).await;
        ctx.repo.close_task(&EntityId::new("T1")).await.unwrap();
        ctx.repo
            .create(Task::new(inbox_id(), "Buy bread"))
            .await
            .unwrap();
        ctx.remote
            .fail_next(Op::Batch, RemoteError::RateLimited { retry_after: None });

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.deferred, 2);
        let queue = ctx.repo.mutations().await.unwrap();
        assert!(queue.iter().all(|m| m.status == MutationStatus::Pending));
        assert!(queue.iter().all(|m| m.attempts == 1));

        let report = ctx.repo.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(ctx.remote.effects(), 2);
    }

    #[tokio::test]
    async fn test_batch_members_cannot_be_dismissed_mid_flight() {
        let (ctx, flush) = batch_in_flight().await;

        let queue = ctx.repo.mutations().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|m| m.status == MutationStatus::Flushing));
        let placeholder = queue[0].entity_id.clone();
        let result = ctx.repo.dismiss(queue[0].id).await;
        assert!(matches!(
            result,
            Err(SyncError::WrongStatus {
                status: MutationStatus::Flushing,
                ..
            })
        ));

        let report = flush.await.unwrap().unwrap();
        assert_eq!(report.delivered, 2);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        assert_eq!(ctx.remote.records().len(), 2);
        assert!(ctx
            .repo
            .get_cached_entity(EntityKind::Task, &placeholder)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            ctx.repo.get_cached(&Scope::tasks(&inbox_id())).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_mutation_removed_mid_flight_does_not_abort_the_batch() {
        let (ctx, flush) = batch_in_flight().await;
        let first = ctx.repo.mutations().await.unwrap()[0].id;
        ctx.repo.store().delete_mutation(first).await.unwrap();

        let report = flush.await.unwrap().unwrap();

        assert_eq!(report.delivered, 2);
        assert!(ctx.repo.mutations().await.unwrap().is_empty());
        let resolved = ctx
            .repo
            .get_cached_entity(EntityKind::Task, &EntityId::new("T101"))
            .await
            .unwrap()
            .and_then(Task::from_record)
            .unwrap();
        assert_eq!(resolved.content, "two");
    }

    #[tokio::test]
    async fn test_deferred_precheck_returns_the_rest_of_the_flight() {
        let ctx = batched(10).await;
        let patch = TaskPatch {
            priority: FieldUpdate::Set(4),
            ..Default::default()
        };
        ctx.repo.update(&EntityId::new("T1"), patch).await.unwrap();
        ctx.repo
            .create(Task::new(inbox_id(), "Buy bread"))
            .await
            .unwrap();
        ctx.remote.fail_next(Op::Get, RemoteError::Timeout);

        let report = ctx.repo.flush().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(ctx.remote.calls(Op::Batch), 0);
        let counts = ctx.repo.queue_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.flushing, 0);

        let report = ctx.repo.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
    }
}
