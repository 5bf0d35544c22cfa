use std::{env, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use memguarded_common::{config::DEFAULT_SOCKET_PATH, store::SecretStore};
use memguarded_server::{
    SecretServer, ServerOptions, ServiceGroup, SigtermService, StoreService,
};

/// Daemon on a plain socket that logs every secret replacement
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let socket = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());

    println!("=== memguarded daemon example ===");
    println!("Listening on {socket}, press Ctrl+C to stop");
    println!("Try: memguarded --socket {socket} set --stdin <<< 'hunter2'");

    let store = Arc::new(SecretStore::new());
    let watch = store.watch();
    {
        let store = Arc::clone(&store);
        thread::spawn(move || loop {
            if watch.recv_timeout(Duration::from_secs(1)) {
                let len = store.open().map(|secret| secret.len()).unwrap_or(0);
                tracing::info!("Secret replaced ({} bytes)", len);
            }
        });
    }

    let server = SecretServer::new(ServerOptions::new(&socket), Arc::clone(&store));

    ServiceGroup::new()
        .with(Arc::new(SigtermService::new()?))
        .with(Arc::new(StoreService::new(store)))
        .with(Arc::new(server))
        .run()
        .context("Daemon error")?;

    println!("✓ Daemon stopped, secret purged");
    Ok(())
}
