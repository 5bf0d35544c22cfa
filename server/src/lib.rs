//! memguarded daemon
//!
//! Holds one secret in sealed memory and serves it over an authenticated Unix
//! domain socket to processes of the same user:
//!
//! - [`auth`]: peer uid check and optional executable pinning
//! - [`gate`]: optional shared socket password
//! - [`commands`]: `socket_password`, `set_secret` and `get_secret` handlers
//! - [`session`]: per-connection state machine
//! - [`server`]: accept loop, one thread per connection
//! - [`supervisor`]: fail-together service group running the daemon

pub mod auth;
pub mod commands;
pub mod gate;
pub mod server;
pub mod session;
pub mod supervisor;

pub use auth::PeerAuthenticator;
pub use gate::GatePassword;
pub use server::{SecretServer, ServerOptions, Transport};
pub use supervisor::{Service, ServiceGroup, SigtermService, StoreService};
