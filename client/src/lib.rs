//! memguarded client library
//!
//! Connects to the memguarded daemon over its local socket, optionally through
//! mutual TLS, and moves the secret between the daemon and a local sealed
//! [`SecretStore`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use memguarded_client::{ClientConfig, SecretClient, SecretStore};
//!
//! # fn main() -> memguarded_client::Result<()> {
//! let config = ClientConfig::new()
//!     .with_socket_path("/tmp/memguarded.sock")
//!     .with_timeout(Duration::from_secs(10));
//!
//! let mut client = SecretClient::new(config);
//! client.dial()?;
//!
//! let secret = SecretStore::new();
//! client.get_secret(&secret)?;
//! println!("secret is {} bytes long", secret.open()?.len());
//!
//! client.close();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
pub use memguarded_common::{
    config::DEFAULT_SOCKET_PATH, ClientCertPath, MemguardedError, Result, SecretStore, Settings,
};
