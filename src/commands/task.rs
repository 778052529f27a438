use chrono::NaiveDate;
use clap::{Args, Subcommand};
use std::io::{self, Write};

use super::{truncate, OutputFormat, Session};
use todu::models::{Entity, EntityId, EntityKind, FieldUpdate, Scope, Task, TaskPatch};

#[derive(Args)]
pub struct TaskCommand {
    #[command(subcommand)]
    pub command: TaskSubcommand,
}

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// List active tasks in a project
    List {
        /// Project ID
        #[arg(long, short)]
        project: String,

        /// Only tasks in this section
        #[arg(long)]
        section: Option<String>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Add a task
    Add {
        /// What needs doing
        content: String,

        /// Project ID
        #[arg(long, short)]
        project: String,

        /// Section ID
        #[arg(long)]
        section: Option<String>,

        /// Longer description
        #[arg(long)]
        description: Option<String>,

        /// Priority from 1 (normal) to 4 (urgent)
        #[arg(long)]
        priority: Option<u8>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        /// Labels (can be repeated)
        #[arg(long = "label", value_name = "LABEL")]
        labels: Vec<String>,
    },

    /// Change fields of a task
    Update {
        /// Task ID
        id: String,

        /// New content
        #[arg(long)]
        content: Option<String>,

        /// New description
        #[arg(long)]
        description: Option<String>,

        /// Remove the description
        #[arg(long, conflicts_with = "description")]
        clear_description: bool,

        /// New priority (1-4)
        #[arg(long)]
        priority: Option<u8>,

        /// New due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        /// Remove the due date
        #[arg(long, conflicts_with = "due")]
        clear_due: bool,

        /// Replace labels (can be repeated)
        #[arg(long = "label", value_name = "LABEL")]
        labels: Vec<String>,

        /// Remove all labels
        #[arg(long, conflicts_with = "labels")]
        clear_labels: bool,

        /// Move to a section
        #[arg(long)]
        section: Option<String>,

        /// Take the task out of its section
        #[arg(long, conflicts_with = "section")]
        clear_section: bool,
    },

    /// Mark a task done
    Close {
        /// Task ID
        id: String,
    },

    /// Bring a closed task back
    Reopen {
        /// Task ID
        id: String,
    },

    /// Delete a task
    Delete {
        /// Task ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl TaskCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            TaskSubcommand::List {
                project,
                section,
                format,
            } => {
                let project_id = EntityId::new(project.as_str());
                let tasks: Vec<Task> = session
                    .read(&Scope::tasks(&project_id))
                    .await?
                    .into_iter()
                    .filter_map(Task::from_record)
                    .filter(Task::is_active)
                    .filter(|t| match section {
                        Some(s) => t.section_id.as_ref().map(EntityId::as_str) == Some(s.as_str()),
                        None => true,
                    })
                    .collect();

                if tasks.is_empty() {
                    println!("No tasks found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&tasks)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<14}  {:<3}  {:<10}  {:<40}  LABELS", "ID", "PRI", "DUE", "CONTENT");
                        println!("{}", "-".repeat(90));
                        for task in &tasks {
                            let due = task.due.map(|d| d.to_string()).unwrap_or_default();
                            println!(
                                "{:<14}  p{:<2}  {:<10}  {:<40}  {}",
                                task.id,
                                task.priority,
                                due,
                                truncate(&task.content, 40),
                                task.labels.join(", ")
                            );
                        }
                        println!("\nTotal: {} task(s)", tasks.len());
                    }
                }
                Ok(())
            }

            TaskSubcommand::Add {
                content,
                project,
                section,
                description,
                priority,
                due,
                labels,
            } => {
                let mut task = Task::new(EntityId::new(project.as_str()), content.trim());
                if let Some(section) = section {
                    task = task.with_section(EntityId::new(section.as_str()));
                }
                if let Some(description) = description {
                    task = task.with_description(description);
                }
                if let Some(priority) = priority {
                    task = task.with_priority(*priority);
                }
                if let Some(due) = due {
                    task = task.with_due(parse_date(due)?);
                }
                if !labels.is_empty() {
                    task = task.with_labels(labels.clone());
                }

                let created = session.repo.create(task).await?;
                println!("Added task {}: {}", created.id, created.content);
                session.push().await?;
                Ok(())
            }

            TaskSubcommand::Update {
                id,
                content,
                description,
                clear_description,
                priority,
                due,
                clear_due,
                labels,
                clear_labels,
                section,
                clear_section,
            } => {
                let due = due.as_deref().map(parse_date).transpose()?;
                let labels = if labels.is_empty() {
                    None
                } else {
                    Some(labels.clone())
                };
                let patch = TaskPatch {
                    content: FieldUpdate::from_flags(content.clone(), false),
                    description: FieldUpdate::from_flags(description.clone(), *clear_description),
                    priority: FieldUpdate::from_flags(*priority, false),
                    due: FieldUpdate::from_flags(due, *clear_due),
                    labels: FieldUpdate::from_flags(labels, *clear_labels),
                    section_id: FieldUpdate::from_flags(
                        section.as_deref().map(EntityId::new),
                        *clear_section,
                    ),
                };
                if patch.is_empty() {
                    return Err("Nothing to update. Provide at least one option.".into());
                }

                let updated = session.repo.update(&EntityId::new(id.as_str()), patch).await?;
                if let Some(task) = Task::from_record(updated) {
                    println!("Updated task {}: {}", task.id, task.content);
                }
                session.push().await?;
                Ok(())
            }

            TaskSubcommand::Close { id } => {
                let task = session.repo.close_task(&EntityId::new(id.as_str())).await?;
                println!("Closed task {}: {}", task.id, task.content);
                session.push().await?;
                Ok(())
            }

            TaskSubcommand::Reopen { id } => {
                let task = session.repo.reopen_task(&EntityId::new(id.as_str())).await?;
                println!("Reopened task {}: {}", task.id, task.content);
                session.push().await?;
                Ok(())
            }

            TaskSubcommand::Delete { id, force } => {
                let id = EntityId::new(id.as_str());
                let task = session
                    .repo
                    .get_cached_entity(EntityKind::Task, &id)
                    .await?
                    .and_then(Task::from_record)
                    .ok_or_else(|| format!("Task not found: {}", id))?;

                if !force {
                    print!("Delete task '{}'? [y/N] ", task.content);
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                session.repo.delete(EntityKind::Task, &id).await?;
                println!("Deleted task: {}", task.content);
                session.push().await?;
                Ok(())
            }
        }
    }
}

/// Due dates are calendar days only.
fn parse_date(input: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}': expected YYYY-MM-DD", input))
}
