//! Periodic and on-demand fetch-then-flush cycles.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::flush::FlushReport;
use super::{Repository, SyncError, SyncEvent};
use crate::models::{EntityKind, Scope};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub refresh_failures: usize,
    pub flush: FlushReport,
}

/// Drives sync cycles against a [`Repository`].
#[derive(Clone)]
pub struct SyncCoordinator {
    repo: Repository,
    interval: Duration,
    cycle: Arc<Mutex<()>>,
}

impl SyncCoordinator {
    pub fn new(repo: Repository, interval: Duration) -> Self {
        Self {
            repo,
            interval,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    /// The projects scope plus the task and section scopes of every cached
    /// project the server knows about.
    pub async fn relevant_scopes(&self) -> Result<Vec<Scope>, SyncError> {
        let mut scopes = vec![Scope::projects()];
        for project in self.repo.get_cached(&Scope::projects()).await? {
            let id = project.id();
            if project.kind() != EntityKind::Project || id.is_pending() {
                continue;
            }
            scopes.push(Scope::tasks(id));
            scopes.push(Scope::sections(id));
        }
        Ok(scopes)
    }

    /// Refresh whatever is stale, then flush. `None` when a cycle is
    /// already running.
    pub async fn run_cycle(&self) -> Result<Option<CycleReport>, SyncError> {
        let Ok(guard) = self.cycle.try_lock() else {
            tracing::debug!("Sync cycle already running");
            return Ok(None);
        };
        let report = self.cycle_locked().await?;
        drop(guard);

        tracing::info!(
            "Sync cycle: {} scope(s) refreshed, {} failed, {} delivered, {} conflicted, {} deferred",
            report.refreshed,
            report.refresh_failures,
            report.flush.delivered,
            report.flush.conflicted,
            report.flush.deferred
        );
        self.repo.emit(SyncEvent::CycleFinished(report.clone()));
        Ok(Some(report))
    }

    async fn cycle_locked(&self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();

        // Projects first: they decide which other scopes exist.
        let projects = Scope::projects();
        if self.repo.is_stale(&projects).await? {
            match self.repo.refresh(&projects).await {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    tracing::warn!("Refresh of {} failed: {}", projects, e);
                    report.refresh_failures += 1;
                }
            }
        }

        let mut stale = Vec::new();
        for scope in self.relevant_scopes().await? {
            if scope != projects && self.repo.is_stale(&scope).await? {
                stale.push(scope);
            }
        }
        let results = join_all(stale.iter().map(|scope| self.repo.refresh(scope))).await;
        for (scope, result) in stale.iter().zip(results) {
            match result {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    tracing::warn!("Refresh of {} failed: {}", scope, e);
                    report.refresh_failures += 1;
                }
            }
        }

        report.flush = self.repo.flush().await?;
        Ok(report)
    }

    /// A user-requested sync: everything is revalidated regardless of age.
    pub async fn run_manual(&self) -> Result<Option<CycleReport>, SyncError> {
        for scope in self.relevant_scopes().await? {
            self.repo.invalidate(&scope).await?;
        }
        self.run_cycle().await
    }

    /// Run a cycle now and then every interval until shut down.
    pub fn spawn(self) -> SyncHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let cycle = self.cycle.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let manual = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => false,
                    Some(()) = trigger_rx.recv() => true,
                };

                let result = if manual {
                    self.run_manual().await
                } else {
                    self.run_cycle().await
                };
                if let Err(e) = result {
                    tracing::warn!("Sync cycle failed: {}", e);
                }
            }
            tracing::debug!("Sync loop stopped");
        });

        SyncHandle {
            trigger: trigger_tx,
            cycle,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Controls a running sync loop.
pub struct SyncHandle {
    trigger: mpsc::Sender<()>,
    cycle: Arc<Mutex<()>>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask for a manual cycle. Returns false when one is already running
    /// or queued.
    pub fn trigger(&self) -> bool {
        if self.cycle.try_lock().is_err() {
            return false;
        }
        self.trigger.try_send(()).is_ok()
    }

    /// Stop the loop, letting a cycle in progress finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Sync loop ended abnormally: {}", e);
        }
    }
}
