use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use memguarded_common::{
    config::{Settings, DEFAULT_SERVER_NAME, DEFAULT_SOCKET_PATH, DEFAULT_TIMEOUT_SECS},
    error::{MemguardedError, Result},
    platform_socket::{LocalStream, SessionStream},
    protocol::{
        write_bytes, write_command, DeadlineStream, GET_SECRET, SET_SECRET, SOCKET_PASSWORD,
        TERMINATOR,
    },
    store::{read_secret_until, SecretStore, Termination},
    tls::{server_name, ClientTlsConfig},
    tls_stream::TlsStream,
};
use rustls::pki_types::ServerName;

/// Channel policy used when dialing
#[derive(Debug, Clone)]
pub enum ClientTransport {
    Plain,
    Tls {
        config:      ClientTlsConfig,
        server_name: ServerName<'static>,
    },
}

impl ClientTransport {
    /// Mutual TLS expecting the default `memguarded` server name
    pub fn tls(config: ClientTlsConfig) -> Result<Self> {
        Ok(Self::Tls {
            config,
            server_name: server_name(DEFAULT_SERVER_NAME)?,
        })
    }
}

/// Configuration for the memguarded client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon socket
    pub socket_path:     PathBuf,
    /// Deadline of every command
    pub timeout:         Duration,
    pub transport:       ClientTransport,
    /// Shared gate password sent right after connecting
    pub socket_password: Option<Arc<SecretStore>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path:     PathBuf::from(DEFAULT_SOCKET_PATH),
            timeout:         Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transport:       ClientTransport::Plain,
            socket_password: None,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve settings: socket, timeout, TLS material and the gate password
    /// from the environment. `passphrase` unlocks an encrypted client key.
    pub fn from_settings(settings: &Settings, passphrase: Option<&SecretStore>) -> Result<Self> {
        let mut config = Self::new()
            .with_socket_path(&settings.socket_path)
            .with_timeout(settings.timeout());

        if let Some(tls) = &settings.tls {
            config = config.with_transport(ClientTransport::Tls {
                config:      ClientTlsConfig::load(&tls.client, passphrase)?,
                server_name: server_name(&settings.server_name)?,
            });
        }

        if let Some(password) = settings.socket_password() {
            let store = SecretStore::new();
            store.set_from_bytes(&mut password.as_bytes().to_vec())?;
            config = config.with_socket_password(Arc::new(store));
        }

        Ok(config)
    }

    pub fn with_socket_path<P: Into<PathBuf>>(mut self, socket_path: P) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: ClientTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_socket_password(mut self, password: Arc<SecretStore>) -> Self {
        self.socket_password = Some(password);
        self
    }
}

/// Client session: dial once, then issue commands on the same connection.
///
/// Any failed command drops the connection, since the daemon closes it too.
pub struct SecretClient {
    config:     ClientConfig,
    connection: Option<Box<dyn SessionStream>>,
}

impl SecretClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Connect, run the TLS handshake if configured and present the gate
    /// password if one is set
    pub fn dial(&mut self) -> Result<()> {
        self.close();
        let path = self.config.socket_path.clone();

        let socket = LocalStream::connect(&path).map_err(|e| e.on_client("dial", &path))?;
        socket
            .set_io_timeout(Some(self.config.timeout))
            .map_err(|e| MemguardedError::io("setting timeout", e).on_client("dial", &path))?;

        let mut connection: Box<dyn SessionStream> = match &self.config.transport {
            ClientTransport::Plain => Box::new(socket),
            ClientTransport::Tls {
                config,
                server_name,
            } => {
                let stream = TlsStream::connect(socket, config.shared(), server_name.clone())
                    .map_err(|e| e.on_client("dial", &path))?;
                tracing::debug!("✓ TLS connection established");
                Box::new(stream)
            }
        };

        if let Some(password) = self.config.socket_password.as_ref() {
            let mut stream = DeadlineStream::new(connection.as_mut(), self.config.timeout);
            send_sealed(&mut stream, SOCKET_PASSWORD, password)
                .map_err(|e| e.on_client(SOCKET_PASSWORD, &path))?;
        }

        tracing::debug!("Connected to {}", path.display());
        self.connection = Some(connection);
        Ok(())
    }

    /// Replace the daemon's secret with the one held in `secret`
    pub fn set_secret(&mut self, secret: &SecretStore) -> Result<()> {
        self.with_connection(SET_SECRET, |stream| send_sealed(stream, SET_SECRET, secret))
    }

    /// Fetch the daemon's secret into `secret`
    pub fn get_secret(&mut self, secret: &SecretStore) -> Result<()> {
        self.with_connection(GET_SECRET, |stream| {
            write_command(stream, GET_SECRET, None)?;

            let (mut reply, termination) = read_secret_until(stream, TERMINATOR)?;
            if termination == Termination::EndOfStream {
                return Err(MemguardedError::io(
                    "reading reply",
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection without a reply",
                    ),
                ));
            }
            secret.set_from_bytes(&mut reply)
        })
    }

    /// Shut the connection down, if any.
    ///
    /// Only the write side is closed first. The daemon then finishes every
    /// command already sent before it hangs up, and the rest is drained so
    /// neither end closes with unread bytes.
    pub fn close(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        if let Err(e) = connection.shutdown() {
            tracing::debug!("Failed to shut down connection: {}", e);
            return;
        }

        let mut stream = DeadlineStream::new(connection.as_mut(), self.config.timeout);
        let mut scratch = [0u8; 256];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Connection closed uncleanly: {}", e);
                    break;
                }
            }
        }
    }

    fn with_connection<F>(&mut self, command: &'static str, op: F) -> Result<()>
    where
        F: FnOnce(&mut DeadlineStream<'_>) -> Result<()>,
    {
        let timeout = self.config.timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| MemguardedError::NotConnected(self.config.socket_path.clone()))?;

        let result = op(&mut DeadlineStream::new(connection.as_mut(), timeout));
        if let Err(e) = result {
            // the daemon closes on any failed command, nothing left to drain
            self.connection = None;
            return Err(e.on_client(command, &self.config.socket_path));
        }
        Ok(())
    }
}

impl Drop for SecretClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// `<command> <secret>\n`, writing the secret straight from its sealed store
fn send_sealed<W: Write + ?Sized>(
    writer: &mut W,
    command: &str,
    secret: &SecretStore,
) -> Result<()> {
    let context = || format!("writing `{command}`");

    write_bytes(writer, command.as_bytes())
        .and_then(|_| write_bytes(writer, b" "))
        .map_err(|e| MemguardedError::io(context(), e))?;
    secret.write(writer)?;
    write_bytes(writer, &[TERMINATOR])
        .and_then(|_| writer.flush())
        .map_err(|e| MemguardedError::io(context(), e))
}
