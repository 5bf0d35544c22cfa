use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use memguarded_common::{
    config::{Settings, DEFAULT_TIMEOUT_SECS},
    error::{MemguardedError, Result},
    platform_socket::{LocalListener, LocalStream},
    store::SecretStore,
    tls::ServerTlsConfig,
};

use crate::{
    auth::PeerAuthenticator,
    commands::CommandRegistry,
    gate::GatePassword,
    session::Session,
    supervisor::Service,
};

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Channel policy of the listener
#[derive(Debug, Clone)]
pub enum Transport {
    /// Bare local socket, usually paired with a gate password
    Plain,
    /// Mutual TLS over the local socket
    Tls(ServerTlsConfig),
}

/// Everything the listener needs, resolved up front
#[derive(Debug)]
pub struct ServerOptions {
    pub socket_path:              PathBuf,
    pub timeout:                  Duration,
    pub stop_on_any_client_error: bool,
    pub transport:                Transport,
    pub gate_password:            Option<GatePassword>,
    pub authenticator:            PeerAuthenticator,
}

impl ServerOptions {
    /// Plain channel, no gate, own uid, default timeout
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path:              socket_path.into(),
            timeout:                  Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stop_on_any_client_error: false,
            transport:                Transport::Plain,
            gate_password:            None,
            authenticator:            PeerAuthenticator::new(),
        }
    }

    /// Resolve settings: load TLS material and read the gate password from
    /// the environment
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let transport = match &settings.tls {
            Some(tls) => Transport::Tls(
                ServerTlsConfig::load(&tls.server).context("Failed to load server TLS material")?,
            ),
            None => {
                tracing::warn!("⚠️  TLS disabled, serving a plain local socket");
                Transport::Plain
            }
        };

        let gate_password = settings
            .socket_password()
            .map(|password| GatePassword::new(password.as_bytes()));
        if gate_password.is_some() {
            tracing::info!("Socket password gate enabled (from ${})", settings.socket_password_env);
        }

        Ok(Self {
            socket_path: settings.socket_path.clone(),
            timeout: settings.timeout(),
            stop_on_any_client_error: settings.stop_on_any_client_error,
            transport,
            gate_password,
            authenticator: PeerAuthenticator::new()
                .with_allowed_executables(&settings.allowed_client_hashes),
        })
    }
}

/// The daemon listener: accepts connections on the local socket and runs one
/// session per connection on its own thread.
#[derive(Debug, Clone)]
pub struct SecretServer {
    inner: Arc<ServerInner>,
}

#[derive(Debug)]
struct ServerInner {
    socket_path:              PathBuf,
    timeout:                  Duration,
    stop_on_any_client_error: bool,
    transport:                Transport,
    gate:                     Option<Arc<GatePassword>>,
    authenticator:            PeerAuthenticator,
    registry:                 CommandRegistry,
    store:                    Arc<SecretStore>,
    stopping:                 AtomicBool,
    client_failure:           Mutex<Option<String>>,
}

impl SecretServer {
    pub fn new(options: ServerOptions, store: Arc<SecretStore>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                socket_path: options.socket_path,
                timeout: options.timeout,
                stop_on_any_client_error: options.stop_on_any_client_error,
                transport: options.transport,
                gate: options.gate_password.map(Arc::new),
                authenticator: options.authenticator,
                registry: CommandRegistry::new(),
                store,
                stopping: AtomicBool::new(false),
                client_failure: Mutex::new(None),
            }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.inner.store
    }

    /// Bind the socket, replacing a stale one
    pub fn bind(&self) -> Result<LocalListener> {
        let listener = LocalListener::bind(&self.inner.socket_path)?;
        tracing::info!(
            "✓ memguarded server successfully bound to socket: {}",
            self.inner.socket_path.display()
        );
        Ok(listener)
    }

    /// Accept connections until [`SecretServer::stop`] is called, or until a
    /// connection fails under the stop-on-any-client-error policy, which makes
    /// this return an error. The socket file is removed on return.
    pub fn serve(&self, listener: LocalListener) -> anyhow::Result<()> {
        tracing::info!("memguarded server listening on: {}", listener.path().display());

        while !self.is_stopping() {
            let socket = match listener.accept_timeout(ACCEPT_POLL) {
                Ok(Some(socket)) => socket,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Connection error: {}", e);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };
            tracing::debug!("New connection received");

            if let Err(e) = listener.verify_permissions() {
                drop(socket);
                self.client_failed(&e);
                continue;
            }

            let server = self.clone();
            let spawned = thread::Builder::new()
                .name("memguarded-session".to_string())
                .spawn(move || {
                    if let Err(e) = server.handle_connection(socket) {
                        server.client_failed(&e);
                    }
                });
            if let Err(e) = spawned {
                tracing::error!("Failed to spawn session thread: {}", e);
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        drop(listener);

        match self.take_client_failure() {
            Some(reason) => Err(anyhow!("listener stopped after client error: {reason}")),
            None => Ok(()),
        }
    }

    /// Request the accept loop to return
    pub fn stop(&self) {
        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutting down memguarded server...");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn handle_connection(&self, socket: LocalStream) -> Result<()> {
        let inner = &self.inner;
        let mut session =
            Session::establish(socket, &inner.transport, inner.timeout, inner.gate.clone())?;
        session.authorize(&inner.authenticator)?;
        if let Some(peer) = session.peer() {
            tracing::debug!("Serving peer uid {} (pid {:?})", peer.uid, peer.pid);
        }
        session.run(&inner.registry, &inner.store)
    }

    /// Connection-scoped failures end only their connection unless the
    /// stop-on-any-client-error policy is set. Anything else breaks the daemon
    /// itself and always stops the listener.
    fn client_failed(&self, error: &MemguardedError) {
        let connection_scoped = error.is_connection_scoped();
        match error {
            MemguardedError::Unauthorized { .. } | MemguardedError::UntrustedExecutable { .. } => {
                tracing::warn!("Rejected connection: {}", error)
            }
            _ if connection_scoped => tracing::error!("Client error: {}", error),
            _ => tracing::error!("Daemon fault while serving a client: {}", error),
        }

        if self.inner.stop_on_any_client_error || !connection_scoped {
            let mut failure = self
                .inner
                .client_failure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            failure.get_or_insert_with(|| error.to_string());
            drop(failure);
            self.stop();
        }
    }

    fn take_client_failure(&self) -> Option<String> {
        self.inner
            .client_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Service for SecretServer {
    fn name(&self) -> &str {
        "listener"
    }

    fn start(&self) -> anyhow::Result<()> {
        let listener = self.bind().with_context(|| {
            format!("Failed to bind to socket: {}", self.socket_path().display())
        })?;
        self.serve(listener)
    }

    fn stop(&self, cause: Option<&anyhow::Error>) {
        if let Some(cause) = cause {
            tracing::debug!("Listener stopping because: {:#}", cause);
        }
        SecretServer::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_a_plain_ungated_socket() {
        let options = ServerOptions::new("/tmp/test.sock");
        assert!(matches!(options.transport, Transport::Plain));
        assert!(options.gate_password.is_none());
        assert!(!options.stop_on_any_client_error);
        assert_eq!(options.timeout, Duration::from_secs(10));
    }

    #[test]
    fn options_follow_settings() {
        let settings = Settings {
            socket_path: PathBuf::from("/run/memguarded.sock"),
            timeout_secs: 3,
            stop_on_any_client_error: true,
            socket_password_env: "MEMGUARDED_TEST_UNSET_GATE".to_string(),
            ..Settings::default()
        };

        let options = ServerOptions::from_settings(&settings).unwrap();
        assert_eq!(options.socket_path, PathBuf::from("/run/memguarded.sock"));
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert!(options.stop_on_any_client_error);
        assert!(options.gate_password.is_none());
    }

    #[test]
    fn missing_tls_material_fails_option_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            tls: Some(memguarded_common::TlsSettings {
                server: memguarded_common::ServerCertPath::in_dir(dir.path()),
                client: memguarded_common::ClientCertPath::in_dir(dir.path()),
            }),
            ..Settings::default()
        };
        assert!(ServerOptions::from_settings(&settings).is_err());
    }

    fn tolerant_server() -> SecretServer {
        SecretServer::new(ServerOptions::new("/tmp/unbound.sock"), Arc::new(SecretStore::new()))
    }

    #[test]
    fn connection_errors_leave_a_tolerant_server_running() {
        let server = tolerant_server();
        server.client_failed(&MemguardedError::UnknownCommand("bogus".to_string()));
        server.client_failed(&MemguardedError::Unauthorized {
            uid:      1,
            expected: 0,
        });

        assert!(!server.is_stopping());
        assert!(server.take_client_failure().is_none());
    }

    #[test]
    fn daemon_faults_stop_even_a_tolerant_server() {
        let server = tolerant_server();
        server.client_failed(&MemguardedError::Sealing("open"));

        assert!(server.is_stopping());
        assert_eq!(server.take_client_failure().as_deref(), Some("enclave open failed"));
    }

    #[test]
    fn stop_before_serve_returns_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let server = SecretServer::new(
            ServerOptions::new(dir.path().join("s.sock")),
            Arc::new(SecretStore::new()),
        );
        let listener = server.bind().unwrap();
        server.stop();
        server.serve(listener).unwrap();
        assert!(!dir.path().join("s.sock").exists());
    }
}
