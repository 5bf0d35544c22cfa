use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised by the secret store, the transports and both protocol sessions.
///
/// Messages never include secret bytes; at most a command name, a path or a
/// numeric peer identity.
#[derive(Debug, Error)]
pub enum MemguardedError {
    /// A read was attempted before any secret was stored
    #[error("secret is not set")]
    NotSet,

    /// Transport read or write failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source:  io::Error,
    },

    /// Peer user id does not match the daemon's user id
    #[error("unauthorized peer uid {uid} (expected {expected})")]
    Unauthorized { uid: u32, expected: u32 },

    /// The peer executable is not in the configured allow-list
    #[error("untrusted executable for peer pid {pid}")]
    UntrustedExecutable { pid: u32 },

    /// The platform or transport cannot report peer credentials
    #[error("peer credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// A gated command arrived before a valid socket password
    #[error("socket password required before this command")]
    GateNotOpen,

    /// A socket password was presented but did not match
    #[error("socket password rejected")]
    GateRejected,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// The per-command inactivity deadline elapsed
    #[error("timed out while {0}")]
    Timeout(String),

    /// TLS negotiation or certificate verification failed
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Certificate or key material could not be loaded
    #[error("TLS configuration: {0}")]
    Tls(String),

    /// A client command was issued before `dial` succeeded
    #[error("not connected to {}", .0.display())]
    NotConnected(PathBuf),

    /// Sealing or opening an enclave failed
    #[error("enclave {0} failed")]
    Sealing(&'static str),

    #[error("cannot ask for a secret, stdin is not a terminal")]
    NoTerminal,

    /// Client-side failure annotated with the remote path and command
    #[error("`{command}` on {}: {source}", .path.display())]
    Client {
        command: &'static str,
        path:    PathBuf,
        #[source]
        source:  Box<MemguardedError>,
    },
}

/// Result alias used across the memguarded crates
pub type Result<T> = std::result::Result<T, MemguardedError>;

impl MemguardedError {
    /// Classify an I/O error, turning socket timeouts into [`MemguardedError::Timeout`]
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        // the TLS stream tunnels late handshake failures through io::Error
        if let Some(Self::HandshakeFailed(reason)) =
            source.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
        {
            return Self::HandshakeFailed(reason.clone());
        }

        let context = context.into();
        match source.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout(context),
            _ => Self::Io { context, source },
        }
    }

    /// Attach client-side context to an error
    pub fn on_client(self, command: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::Client {
            command,
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Whether the error only concerns the connection it happened on
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(
            self,
            Self::Tls(_) | Self::Sealing(_) | Self::NoTerminal | Self::NotConnected(_)
        )
    }

    /// The innermost error, skipping client annotations
    pub fn root(&self) -> &MemguardedError {
        match self {
            Self::Client { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<io::Error> for MemguardedError {
    fn from(source: io::Error) -> Self {
        Self::io("I/O failure", source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_timeouts_become_timeout_errors() {
        let err = MemguardedError::io("reading command", io::ErrorKind::WouldBlock.into());
        assert!(matches!(err, MemguardedError::Timeout(ref what) if what == "reading command"));

        let err = MemguardedError::io("reading command", io::ErrorKind::TimedOut.into());
        assert!(matches!(err, MemguardedError::Timeout(_)));

        let err = MemguardedError::io("reading command", io::ErrorKind::BrokenPipe.into());
        assert!(matches!(err, MemguardedError::Io { .. }));
    }

    #[test]
    fn only_daemon_side_faults_escape_the_connection() {
        for err in [
            MemguardedError::NotSet,
            MemguardedError::GateNotOpen,
            MemguardedError::UnknownCommand("bogus".to_string()),
            MemguardedError::Timeout("reading command".to_string()),
            MemguardedError::HandshakeFailed("bad certificate".to_string()),
        ] {
            assert!(err.is_connection_scoped(), "{err}");
        }
        assert!(!MemguardedError::Sealing("seal").is_connection_scoped());
        assert!(!MemguardedError::Tls("missing key".to_string()).is_connection_scoped());
    }

    #[test]
    fn handshake_failures_tunneled_through_io_keep_their_kind() {
        let tunneled = io::Error::new(
            io::ErrorKind::InvalidData,
            MemguardedError::HandshakeFailed("received fatal alert: DecryptError".to_string()),
        );
        let err = MemguardedError::io("reading secret", tunneled);
        assert!(matches!(
            err,
            MemguardedError::HandshakeFailed(ref reason) if reason.contains("DecryptError")
        ));
    }

    #[test]
    fn client_context_names_command_and_path() {
        let err = MemguardedError::NotSet.on_client("get_secret", "/tmp/memguarded.sock");
        let text = err.to_string();
        assert!(text.contains("get_secret"));
        assert!(text.contains("/tmp/memguarded.sock"));
        assert!(matches!(err.root(), MemguardedError::NotSet));
    }
}
