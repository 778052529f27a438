use clap::{Args, Subcommand};
use serde_json::json;

use super::{truncate, OutputFormat, Session};
use todu::models::Mutation;

#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Show changes waiting for the server
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Send a conflicted change again, keeping your values
    Retry {
        /// Mutation ID
        id: i64,
    },

    /// Drop a conflicted change and restore the previous state
    Dismiss {
        /// Mutation ID
        id: i64,
    },
}

impl QueueCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            QueueSubcommand::List { format } => {
                let mutations = session.repo.mutations().await?;
                if mutations.is_empty() {
                    println!("Nothing queued");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        let rows: Vec<_> = mutations.iter().map(mutation_json).collect();
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "{:<6}  {:<10}  {:<7}  {:<8}  {:<14}  NOTE",
                            "ID", "STATUS", "ACTION", "KIND", "ENTITY"
                        );
                        println!("{}", "-".repeat(90));
                        for m in &mutations {
                            println!(
                                "{:<6}  {:<10}  {:<7}  {:<8}  {:<14}  {}",
                                m.id,
                                m.status,
                                m.action,
                                m.kind,
                                m.entity_id,
                                truncate(m.note.as_deref().unwrap_or(""), 60)
                            );
                        }
                        let counts = session.repo.queue_counts().await?;
                        println!(
                            "\n{} pending, {} in flight, {} conflicted",
                            counts.pending, counts.flushing, counts.conflicted
                        );
                    }
                }
                Ok(())
            }

            QueueSubcommand::Retry { id } => {
                session.repo.retry(*id).await?;
                println!("Mutation {} queued again", id);
                session.push().await?;
                Ok(())
            }

            QueueSubcommand::Dismiss { id } => {
                session.repo.dismiss(*id).await?;
                println!("Mutation {} dismissed", id);
                Ok(())
            }
        }
    }
}

fn mutation_json(m: &Mutation) -> serde_json::Value {
    json!({
        "id": m.id,
        "status": m.status,
        "action": m.action.name(),
        "kind": m.kind,
        "entity_id": m.entity_id,
        "attempts": m.attempts,
        "created_at": m.created_at,
        "note": m.note,
    })
}
