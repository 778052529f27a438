use clap::{Args, Subcommand};

use super::{OutputFormat, Session};
use todu::models::{Entity, EntityId, EntityKind, Scope, Section};

#[derive(Args)]
pub struct SectionCommand {
    #[command(subcommand)]
    pub command: SectionSubcommand,
}

#[derive(Subcommand)]
pub enum SectionSubcommand {
    /// List sections of a project
    List {
        /// Project ID
        #[arg(long, short)]
        project: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Add a section to a project
    Add {
        /// Section name
        name: String,

        /// Project ID
        #[arg(long, short)]
        project: String,
    },

    /// Delete a section
    Delete {
        /// Section ID
        id: String,
    },
}

impl SectionCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            SectionSubcommand::List { project, format } => {
                let mut sections: Vec<Section> = session
                    .read(&Scope::sections(&EntityId::new(project.as_str())))
                    .await?
                    .into_iter()
                    .filter_map(Section::from_record)
                    .collect();
                sections.sort_by_key(|s| s.order);

                if sections.is_empty() {
                    println!("No sections found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&sections)?);
                    }
                    OutputFormat::Text => {
                        for section in &sections {
                            println!("{:<14}  {}", section.id, section.name);
                        }
                    }
                }
                Ok(())
            }

            SectionSubcommand::Add { name, project } => {
                let section = Section::new(EntityId::new(project.as_str()), name.trim());
                let created = session.repo.create(section).await?;
                println!("Added section {}: {}", created.id, created.name);
                session.push().await?;
                Ok(())
            }

            SectionSubcommand::Delete { id } => {
                session
                    .repo
                    .delete(EntityKind::Section, &EntityId::new(id.as_str()))
                    .await?;
                println!("Deleted section {}", id);
                session.push().await?;
                Ok(())
            }
        }
    }
}
