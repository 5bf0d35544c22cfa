use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use memguarded_common::{config::Settings, store::SecretStore};
use memguarded_server::{
    SecretServer, ServerOptions, ServiceGroup, SigtermService, StoreService,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memguarded-server")]
#[command(about = "Holds one secret in sealed memory and serves it over a local socket")]
#[command(version)]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path, overrides the settings file
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Stop the whole listener when any connection fails
    #[arg(long)]
    stop_on_any_client_error: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("Invalid log level")?)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting memguarded server...");

    // SAFETY: getuid() is always safe to call
    if unsafe { libc::getuid() } == 0 {
        tracing::warn!("Server running as root, only root clients will be accepted");
    }

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(socket) = args.socket {
        settings.socket_path = socket;
    }
    settings.stop_on_any_client_error |= args.stop_on_any_client_error;

    let options = ServerOptions::from_settings(&settings).context("Failed to create server")?;
    let store = Arc::new(SecretStore::new());
    let server = SecretServer::new(options, Arc::clone(&store));

    ServiceGroup::new()
        .with(Arc::new(SigtermService::new()?))
        .with(Arc::new(StoreService::new(store)))
        .with(Arc::new(server))
        .run()
        .context("Server error")?;

    tracing::info!("Bye !");
    Ok(())
}
