use std::path::PathBuf;

use clap::Parser;
use parley_server::{PresenceBroadcaster, ServerConfig};
use parley_store::Database;

#[derive(Parser)]
#[command(name = "parley", about = "Chat backend: rooms, presence, offline message sync")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090, env = "PARLEY_PORT")]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.parley/database/parley.db.
    #[arg(long, env = "PARLEY_DB")]
    db_path: Option<PathBuf>,

    /// Maximum number of live sessions.
    #[arg(long, default_value_t = 10_000)]
    max_sessions: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting parley server");

    let db_path = cli.db_path.unwrap_or_else(|| {
        dirs_home().join(".parley").join("database").join("parley.db")
    });

    let db = Database::open(&db_path).expect("Failed to open database");
    tracing::info!(path = %db_path.display(), "Database opened");

    // Presence fan-out channel
    let presence = PresenceBroadcaster::new(1024);

    // Start server
    let config = ServerConfig {
        port: cli.port,
        max_sessions: cli.max_sessions,
        ..Default::default()
    };
    let handle = parley_server::start(config, db, presence)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "Parley server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
