//! mail-maildir-core-rs: maildir store and auth-worker multiplexer daemon
//!
//! Hosts the auth-worker registry for a login process. The maildir save
//! engine lives in the library crate and is consumed by the serving layers
//! above this process.

use std::path::PathBuf;

use clap::Parser;
use mail_maildir_core_rs::auth::AuthRegistry;
use mail_maildir_core_rs::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line overrides for the environment configuration
#[derive(Debug, Parser)]
#[command(version, about = "Maildir store and auth-worker multiplexer")]
struct Cli {
    /// Directory scanned for auth-worker sockets (defaults to the cwd)
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

/// Application entry point
///
/// Initializes tracing from the environment, loads configuration, connects
/// to the auth-worker pool, and runs until interrupted.
///
/// # Environment Variables
///
/// See [`Config::load_from_env`] for the full list.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_from_env()?;
    if let Some(dir) = cli.socket_dir {
        config.auth_socket_dir = dir;
    }

    let registry = AuthRegistry::new(&config);
    registry.init().await;
    info!(
        socket_dir = %config.auth_socket_dir.display(),
        workers = registry.connection_count(),
        mechs = ?registry.available_mechs(),
        "auth registry started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
