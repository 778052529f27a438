mod config_cmd;
mod project;
mod queue;
mod section;
mod sync_cmd;
mod task;

pub use config_cmd::ConfigCommand;
pub use project::ProjectCommand;
pub use queue::QueueCommand;
pub use section::SectionCommand;
pub use sync_cmd::SyncCommand;
pub use task::TaskCommand;

use clap::ValueEnum;
use todu::models::{Record, Scope};
use todu::sync::{Repository, SyncError};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// What every data command works against.
pub struct Session {
    pub repo: Repository,
    /// False when no server is configured; writes then stay queued.
    pub sync_enabled: bool,
}

impl Session {
    /// Cache-first read. When the server can't be reached the cached copy
    /// is shown instead of failing.
    pub async fn read(&self, scope: &Scope) -> Result<Vec<Record>, SyncError> {
        if !self.sync_enabled {
            return self.repo.get_cached(scope).await;
        }
        match self.repo.fetch(scope).await {
            Ok(fetched) => Ok(fetched.items),
            Err(SyncError::Remote(e)) => {
                tracing::warn!("Showing cached {}: {}", scope, e);
                self.repo.get_cached(scope).await
            }
            Err(e) => Err(e),
        }
    }

    /// One flush attempt after a write.
    pub async fn push(&self) -> Result<(), SyncError> {
        if !self.sync_enabled {
            return Ok(());
        }
        let report = self.repo.flush().await?;
        if report.conflicted > 0 {
            eprintln!(
                "{} change(s) conflicted with the server; see `todu queue list`",
                report.conflicted
            );
        }
        if report.deferred > 0 {
            eprintln!("Server unavailable; changes will be sent on the next sync");
        }
        Ok(())
    }
}

/// Shortens long names for tabular output.
pub(crate) fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let head: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
