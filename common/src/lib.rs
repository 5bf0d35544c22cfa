//! memguarded common library
//!
//! Shared building blocks of the memguarded daemon and its client:
//!
//! - Sealed in-memory secret storage with change notification
//! - Unix domain socket transport with peer credential lookup
//! - TLS stream wrapper and PEM configuration loading for mutual TLS
//! - The line-oriented command protocol
//! - Settings and certificate path defaults
//!
//! Nothing in this crate ever logs or formats secret bytes.

#[cfg(not(unix))]
compile_error!("memguarded requires Unix domain sockets");

/// Settings, certificate paths and environment variable names
pub mod config;

/// Sealed storage of secret bytes
pub mod enclave;

/// Error type shared by every memguarded crate
pub mod error;

/// Unix domain socket listener and stream
pub mod platform_socket;

/// Interactive secret entry
pub mod prompt;

/// Command line codec
pub mod protocol;

/// Secret holder with change notification
pub mod store;

/// Mutual TLS configuration loading
pub mod tls;

/// TLS stream wrapper for encrypted local connections
pub mod tls_stream;

// Re-export commonly used types for convenience
pub use config::{ClientCertPath, ServerCertPath, Settings, TlsSettings};
pub use error::{MemguardedError, Result};
pub use platform_socket::{
    ClientCredentials, LocalListener, LocalStream, PeerCredentialSource, SessionStream,
};
pub use protocol::DeadlineStream;
pub use store::{SecretStore, WatchHandle};
pub use tls::{ClientTlsConfig, ServerTlsConfig};
pub use tls_stream::TlsStream;
