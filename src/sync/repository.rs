//! The view layer's entry point: cache-first reads and sync events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, Mutex};

use super::coordinator::CycleReport;
use super::flush::FlushReport;
use super::SyncError;
use crate::db::{LocalStore, QueueCounts};
use crate::models::{Entity, EntityId, EntityKind, Mutation, Record, Scope};
use crate::remote::RemoteClient;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Results of background work, delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Refreshed { scope: Scope, count: usize },
    RefreshFailed { scope: Scope, error: String },
    Flushed(FlushReport),
    Conflict {
        mutation_id: i64,
        kind: EntityKind,
        entity_id: EntityId,
        message: String,
    },
    CycleFinished(CycleReport),
}

/// What [`Repository::fetch`] handed back and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub items: Vec<Record>,
    pub from_cache: bool,
    /// The data is past its TTL; a background refresh has been scheduled.
    pub stale: bool,
}

impl Fetched {
    pub fn typed<E: Entity>(self) -> Vec<E> {
        self.items.into_iter().filter_map(E::from_record).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryOptions {
    /// Mutations per batched submission; 0 sends them one at a time.
    pub batch_size: usize,
}

/// Orchestrates the local store and the remote.
///
/// Cheap to clone; clones share the same queue locks and event channel.
#[derive(Clone)]
pub struct Repository {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) store: LocalStore,
    pub(super) remote: Arc<dyn RemoteClient>,
    pub(super) options: RepositoryOptions,
    /// Held for the whole of a flush: one flight at a time.
    pub(super) flush_lock: Mutex<()>,
    refresh_locks: StdMutex<HashMap<Scope, Arc<Mutex<()>>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Repository {
    /// Wrap a store and a remote. Mutations a previous run left mid-flush
    /// go back to the queue.
    pub async fn open(
        store: LocalStore,
        remote: Arc<dyn RemoteClient>,
        options: RepositoryOptions,
    ) -> Result<Self, SyncError> {
        let recovered = store.reset_interrupted().await?;
        if recovered > 0 {
            tracing::warn!(
                "Re-queued {} mutation(s) interrupted during a previous flush",
                recovered
            );
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                options,
                flush_lock: Mutex::new(()),
                refresh_locks: StdMutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub(super) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub(super) fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// Whatever the cache holds for `scope`. Never touches the network.
    pub async fn get_cached(&self, scope: &Scope) -> Result<Vec<Record>, SyncError> {
        Ok(self.store().get_entities(scope).await?)
    }

    /// A single cached entity.
    pub async fn get_cached_entity(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<Record>, SyncError> {
        Ok(self.store().get_entity(kind, id).await?)
    }

    /// Stale-while-revalidate read.
    ///
    /// Fresh data comes straight from the cache. Stale data also does, with a
    /// background refresh scheduled. An empty, stale scope blocks on a refresh.
    pub async fn fetch(&self, scope: &Scope) -> Result<Fetched, SyncError> {
        // The server has never heard of a pending parent.
        let local_only = scope.project_id().is_some_and(|p| p.is_pending());
        let cached = self.store().get_entities(scope).await?;

        if local_only || !self.store().is_stale(scope).await? {
            return Ok(Fetched {
                items: cached,
                from_cache: true,
                stale: false,
            });
        }

        if !cached.is_empty() {
            self.spawn_refresh(scope.clone());
            return Ok(Fetched {
                items: cached,
                from_cache: true,
                stale: true,
            });
        }

        let items = self.refresh(scope).await?;
        Ok(Fetched {
            items,
            from_cache: false,
            stale: false,
        })
    }

    /// Pull `scope` from the server into the cache and return the result.
    ///
    /// On failure the cache is left as it was. Entities with mutations still
    /// queued keep their local state.
    pub async fn refresh(&self, scope: &Scope) -> Result<Vec<Record>, SyncError> {
        let lock = self.refresh_lock(scope);
        let _guard = lock.lock().await;
        self.refresh_locked(scope).await
    }

    pub async fn is_stale(&self, scope: &Scope) -> Result<bool, SyncError> {
        Ok(self.store().is_stale(scope).await?)
    }

    /// Make the next fetch of `scope` revalidate.
    pub async fn invalidate(&self, scope: &Scope) -> Result<(), SyncError> {
        Ok(self.store().invalidate(scope, None).await?)
    }

    /// The mutation log, oldest first.
    pub async fn mutations(&self) -> Result<Vec<Mutation>, SyncError> {
        Ok(self.store().list_mutations().await?)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, SyncError> {
        Ok(self.store().queue_counts().await?)
    }

    fn refresh_lock(&self, scope: &Scope) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(scope.clone()).or_default().clone()
    }

    /// Refresh in the background unless one is already running for `scope`.
    fn spawn_refresh(&self, scope: Scope) {
        let Ok(guard) = self.refresh_lock(&scope).try_lock_owned() else {
            tracing::debug!("Refresh of {} already in progress", scope);
            return;
        };

        let repo = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = repo.refresh_locked(&scope).await {
                tracing::warn!("Background refresh of {} failed: {}", scope, e);
            }
        });
    }

    async fn refresh_locked(&self, scope: &Scope) -> Result<Vec<Record>, SyncError> {
        // Anything settled while the list is out is newer than the listing.
        let mark = self.store().settlement_mark().await?;
        let listing = match self.inner.remote.list(scope).await {
            Ok(listing) => listing,
            Err(e) => {
                self.emit(SyncEvent::RefreshFailed {
                    scope: scope.clone(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let fresh = self
            .store()
            .rebase_entities(scope, &listing.items, listing.cursor.as_deref(), mark)
            .await?;
        if fresh {
            tracing::debug!("Refreshed {} ({} item(s))", scope, listing.items.len());
        } else {
            tracing::debug!(
                "Refreshed {} around changes settled mid-listing; left stale",
                scope
            );
        }
        self.emit(SyncEvent::Refreshed {
            scope: scope.clone(),
            count: listing.items.len(),
        });

        Ok(self.store().get_entities(scope).await?)
    }
}
