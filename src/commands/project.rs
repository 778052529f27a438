use clap::{Args, Subcommand};
use std::io::{self, Write};

use super::{truncate, OutputFormat, Session};
use todu::models::{Entity, EntityId, EntityKind, FieldUpdate, Project, ProjectPatch, Scope};

#[derive(Args)]
pub struct ProjectCommand {
    #[command(subcommand)]
    pub command: ProjectSubcommand,
}

#[derive(Subcommand)]
pub enum ProjectSubcommand {
    /// List projects
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Add a project
    Add {
        /// Project name
        name: String,

        /// Display color
        #[arg(long)]
        color: Option<String>,
    },

    /// Change a project
    Update {
        /// Project ID
        id: String,

        /// New name
        #[arg(long)]
        name: Option<String>,

        /// New color
        #[arg(long)]
        color: Option<String>,

        /// Remove the color
        #[arg(long, conflicts_with = "color")]
        clear_color: bool,

        /// Mark or unmark as favorite
        #[arg(long)]
        favorite: Option<bool>,
    },

    /// Delete a project with its sections and tasks
    Delete {
        /// Project ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl ProjectCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ProjectSubcommand::List { format } => {
                let projects: Vec<Project> = session
                    .read(&Scope::projects())
                    .await?
                    .into_iter()
                    .filter_map(Project::from_record)
                    .collect();

                if projects.is_empty() {
                    println!("No projects found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&projects)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<14}  {:<30}  COLOR", "ID", "NAME");
                        println!("{}", "-".repeat(60));
                        for project in &projects {
                            let name = if project.is_favorite {
                                format!("* {}", project.name)
                            } else {
                                project.name.clone()
                            };
                            println!(
                                "{:<14}  {:<30}  {}",
                                project.id,
                                truncate(&name, 30),
                                project.color.as_deref().unwrap_or("")
                            );
                        }
                        println!("\nTotal: {} project(s)", projects.len());
                    }
                }
                Ok(())
            }

            ProjectSubcommand::Add { name, color } => {
                let mut project = Project::new(name.trim());
                if let Some(color) = color {
                    project = project.with_color(color);
                }

                let created = session.repo.create(project).await?;
                println!("Added project {}: {}", created.id, created.name);
                session.push().await?;
                Ok(())
            }

            ProjectSubcommand::Update {
                id,
                name,
                color,
                clear_color,
                favorite,
            } => {
                let patch = ProjectPatch {
                    name: FieldUpdate::from_flags(name.clone(), false),
                    color: FieldUpdate::from_flags(color.clone(), *clear_color),
                    is_favorite: FieldUpdate::from_flags(*favorite, false),
                };
                if patch.is_empty() {
                    return Err("Nothing to update. Provide at least one option.".into());
                }

                let updated = session.repo.update(&EntityId::new(id.as_str()), patch).await?;
                if let Some(project) = Project::from_record(updated) {
                    println!("Updated project {}: {}", project.id, project.name);
                }
                session.push().await?;
                Ok(())
            }

            ProjectSubcommand::Delete { id, force } => {
                let id = EntityId::new(id.as_str());
                let project = session
                    .repo
                    .get_cached_entity(EntityKind::Project, &id)
                    .await?
                    .and_then(Project::from_record)
                    .ok_or_else(|| format!("Project not found: {}", id))?;

                if !force {
                    print!(
                        "Delete project '{}' with all its tasks? [y/N] ",
                        project.name
                    );
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                session.repo.delete(EntityKind::Project, &id).await?;
                println!("Deleted project: {}", project.name);
                session.push().await?;
                Ok(())
            }
        }
    }
}
