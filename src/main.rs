use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    ConfigCommand, ProjectCommand, QueueCommand, SectionCommand, Session, SyncCommand,
    TaskCommand,
};
use config::Config;
use todu::db::LocalStore;
use todu::remote::{HttpRemote, Offline, RemoteClient};
use todu::sync::Repository;

#[derive(Parser)]
#[command(name = "todu")]
#[command(version)]
#[command(about = "An offline-first task manager", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    Task(TaskCommand),

    /// Manage projects
    Project(ProjectCommand),

    /// Manage sections within a project
    Section(SectionCommand),

    /// Inspect, retry or dismiss queued changes
    Queue(QueueCommand),

    /// Sync with the server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todu=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let session = open_session(&config).await?;
    match command {
        Commands::Task(cmd) => cmd.run(&session).await?,
        Commands::Project(cmd) => cmd.run(&session).await?,
        Commands::Section(cmd) => cmd.run(&session).await?,
        Commands::Queue(cmd) => cmd.run(&session).await?,
        Commands::Sync(cmd) => cmd.run(&session, &config).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}

async fn open_session(config: &Config) -> Result<Session, Box<dyn std::error::Error>> {
    let store = LocalStore::open(&config.database_path.value, config.cache.policy()).await?;

    let remote: Arc<dyn RemoteClient> = match &config.sync.server_url {
        Some(url) => Arc::new(
            HttpRemote::new(url, config.sync.api_key.clone(), config.sync.timeout())?
                .with_batch(config.sync.batch_size > 0),
        ),
        None => Arc::new(Offline),
    };

    let repo = Repository::open(store, remote, config.sync.repository_options()).await?;
    Ok(Session {
        repo,
        sync_enabled: config.sync.is_configured(),
    })
}
