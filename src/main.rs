use clap::{Parser, Subcommand};

use agora::config::Config;
use agora::server::{self, AppState};
use agora::storage;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "agora", author, version, about = "Community-group Nostr relay")]
struct Cli {
    /// Path to an optional `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run schema migrations and launch the HTTP relay.
    Serve,
    /// Apply schema migrations and exit.
    Migrate,
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Config::from_env(&cli.env)?;
    init_tracing(&cfg.log_level);

    let pool = storage::connect(&cfg.database_url).await?;
    storage::run_migrations(&pool).await?;

    match cli.command {
        Commands::Migrate => {
            tracing::info!("migrations applied");
        }
        Commands::Serve => {
            let addr = server::parse_addr(&cfg.http_addr)?;
            let state = AppState::new(pool, &cfg)?;
            server::serve(addr, state, shutdown_signal()).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
