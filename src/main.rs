use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use consensus_prioritizer::{
    config::{Config, LogFormat},
    consensus::{EngineCore, PriorityCalculator},
    hub::{Hub, NullPublisher},
    server::{AppState, SessionServer},
    storage::SqliteStorage,
};

/// Live group prioritization server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Listen address, overrides BIND_ADDR
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database file, overrides DATABASE_PATH
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log filter, overrides LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Accept participant connections (default)
    Serve,

    /// Recompute a project's priority ranking and print it as JSON
    Calculate {
        /// Project to rank
        #[arg(long)]
        project: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Consensus Prioritizer starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, storage).await,
        Command::Calculate { project } => calculate(storage, project).await,
    }
}

async fn serve(config: Config, storage: SqliteStorage) -> anyhow::Result<()> {
    let (hub, hub_task) = Hub::spawn(&config.hub);

    let listener = match TcpListener::bind(&config.server.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.server.bind_addr, error = %e, "Failed to bind");
            return Err(e.into());
        }
    };

    let directory = Arc::new(storage.clone());
    let state = Arc::new(AppState::new(config, storage, directory, hub));
    let server = SessionServer::new(Arc::clone(&state));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
        }
        signal.cancel();
    });

    if let Err(e) = server.run(listener, shutdown).await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    hub_task.abort();

    info!("Server shutdown complete");
    Ok(())
}

async fn calculate(storage: SqliteStorage, project_id: i64) -> anyhow::Result<()> {
    let directory = Arc::new(storage.clone());
    let calculator = PriorityCalculator::new(EngineCore::new(
        storage,
        directory,
        Arc::new(NullPublisher),
    ));

    let calculation = calculator.calculate_final_scores(project_id).await?;
    println!("{}", serde_json::to_string_pretty(&calculation)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
