//! Sync CLI commands for exchanging changes with the server.

use clap::{Args, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use super::Session;
use crate::config::Config;
use todu::sync::{CycleReport, SyncCoordinator, SyncError, SyncEvent};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Keep syncing on an interval until interrupted
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue state
    Status,
}

impl SyncCommand {
    pub async fn run(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            Some(SyncSubcommand::Status) => self.status(session, config).await,
            None if !session.sync_enabled => Err(SyncCommandError::NotConfigured),
            None if self.watch => self.watch(session, config).await,
            None => self.sync(session, config).await,
        }
    }

    async fn sync(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        let coordinator = SyncCoordinator::new(session.repo.clone(), config.sync.interval());

        println!("Syncing with server...");
        println!();

        match coordinator.run_manual().await? {
            Some(report) => print_report(&report),
            None => println!("A sync is already running."),
        }
        Ok(())
    }

    async fn watch(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        let mut events = session.repo.subscribe();
        let handle = SyncCoordinator::new(session.repo.clone(), config.sync.interval()).spawn();
        println!(
            "Syncing every {}s. Press Ctrl-C to stop.",
            config.sync.interval().as_secs()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(SyncEvent::CycleFinished(report)) => print_report(&report),
                    Ok(SyncEvent::Conflict { mutation_id, message, .. }) => {
                        println!("  ! mutation {} conflicted: {}", mutation_id, message);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} sync event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        println!("Stopping...");
        handle.shutdown().await;
        Ok(())
    }

    async fn status(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match &config.sync.server_url {
            None => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"https://tasks.example.com/api/v1\"");
                println!("    api_key: \"your-api-key\"");
                println!();
                println!("Or set environment variables:");
                println!("  TODU_SYNC_URL");
                println!("  TODU_SYNC_API_KEY");
            }
            Some(server_url) => {
                println!("Server:    {}", server_url);
                match &config.sync.api_key {
                    Some(key) => {
                        let shown: String = key.chars().take(8).collect();
                        println!("API Key:   {}...", shown);
                    }
                    None => println!("API Key:   (none)"),
                }
                println!("Interval:  {}s", config.sync.interval().as_secs());
                match config.sync.batch_size {
                    0 => println!("Batching:  off"),
                    n => println!("Batching:  up to {} per request", n),
                }
            }
        }
        println!();

        let counts = session.repo.queue_counts().await?;
        println!("Queue");
        println!("  pending:    {}", counts.pending);
        println!("  in flight:  {}", counts.flushing);
        println!("  conflicted: {}", counts.conflicted);

        Ok(())
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "  ✓ {} collection(s) refreshed{}",
        report.refreshed,
        if report.refresh_failures > 0 {
            format!(", {} failed", report.refresh_failures)
        } else {
            String::new()
        }
    );
    let flush = &report.flush;
    if flush.is_empty() {
        println!("  ✓ no local changes to send");
    } else {
        println!(
            "  ✓ {} change(s) sent, {} conflicted, {} waiting",
            flush.delivered, flush.conflicted, flush.deferred
        );
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    NotConfigured,
    SyncError(SyncError),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::NotConfigured => {
                write!(f, "Sync is not configured; see `todu sync status`")
            }
            SyncCommandError::SyncError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::NotConfigured => None,
            SyncCommandError::SyncError(e) => Some(e),
        }
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::SyncError(e)
    }
}
