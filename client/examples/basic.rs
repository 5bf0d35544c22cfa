use std::{env, time::Duration};

use anyhow::Result;
use memguarded_client::{ClientConfig, SecretClient, SecretStore, DEFAULT_SOCKET_PATH};

fn main() -> Result<()> {
    let socket = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());

    println!("=== memguarded client example ===");

    let config = ClientConfig::new()
        .with_socket_path(&socket)
        .with_timeout(Duration::from_secs(5));
    let mut client = SecretClient::new(config);

    println!("Connecting to {socket}...");
    client.dial()?;

    let secret = SecretStore::new();
    secret.set_from_bytes(&mut b"example secret".to_vec())?;
    client.set_secret(&secret)?;
    println!("✓ Secret stored");

    let fetched = SecretStore::new();
    client.get_secret(&fetched)?;
    println!("✓ Fetched {} bytes back", fetched.open()?.len());

    client.close();
    Ok(())
}
