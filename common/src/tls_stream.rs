use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::Duration,
};

use rustls::{
    pki_types::ServerName, ClientConfig, ClientConnection, Connection, ServerConfig,
    ServerConnection,
};

use crate::{
    error::{MemguardedError, Result},
    platform_socket::{ClientCredentials, LocalStream, PeerCredentialSource, SessionStream},
};

/// Synchronous TLS session over a local socket.
///
/// Peer credentials are those of the underlying socket, so uid checks keep
/// working once the channel is encrypted.
///
/// In TLS 1.3 the server judges the client certificate after the client has
/// finished its side of the handshake, so a rejection only reaches the client
/// as an alert on a later read or write. Until the first plaintext byte is
/// received such failures are reported as [`MemguardedError::HandshakeFailed`].
pub struct TlsStream {
    socket:      LocalStream,
    tls:         Connection,
    established: bool,
}

impl TlsStream {
    /// Run the server side handshake, requiring a client certificate when the
    /// config carries a client verifier
    pub fn accept(socket: LocalStream, config: Arc<ServerConfig>) -> Result<Self> {
        let tls = ServerConnection::new(config)
            .map_err(|e| MemguardedError::HandshakeFailed(e.to_string()))?;
        let mut stream = Self {
            socket,
            tls: Connection::Server(tls),
            established: false,
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Run the client side handshake against `server_name`
    pub fn connect(
        socket: LocalStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let tls = ClientConnection::new(config, server_name)
            .map_err(|e| MemguardedError::HandshakeFailed(e.to_string()))?;
        let mut stream = Self {
            socket,
            tls: Connection::Client(tls),
            established: false,
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    fn complete_handshake(&mut self) -> Result<()> {
        let failed = |e: io::Error| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                MemguardedError::Timeout("TLS handshake".to_string())
            }
            _ => MemguardedError::HandshakeFailed(e.to_string()),
        };

        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.tls.write_tls(&mut self.socket).map_err(failed)?;
            }
            if self.tls.wants_read() {
                let read = self.tls.read_tls(&mut self.socket).map_err(failed)?;
                if let Err(e) = self.tls.process_new_packets() {
                    // deliver the alert before giving up
                    let _ = self.write_pending();
                    return Err(MemguardedError::HandshakeFailed(e.to_string()));
                }
                if read == 0 {
                    return Err(MemguardedError::HandshakeFailed(
                        "peer closed the connection during the handshake".to_string(),
                    ));
                }
            }
        }

        // a peer that already closed its side may still have sent plaintext
        // worth reading, the next read reports the close
        match self.write_pending() {
            Err(e) if peer_gone(&e) => tracing::debug!("Peer left before final flush: {}", e),
            other => other.map_err(failed)?,
        }
        tracing::debug!("TLS handshake complete");
        Ok(())
    }

    fn write_pending(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket)?;
        }
        Ok(())
    }

    fn protocol_error(&self, error: rustls::Error) -> io::Error {
        if self.established {
            io::Error::new(io::ErrorKind::InvalidData, error)
        } else {
            io::Error::new(
                io::ErrorKind::InvalidData,
                MemguardedError::HandshakeFailed(error.to_string()),
            )
        }
    }

    /// After a failed write, look for the alert that made the peer hang up
    fn surface_alert(&mut self, error: io::Error) -> io::Error {
        if !peer_gone(&error) {
            return error;
        }
        match self.tls.read_tls(&mut self.socket) {
            Ok(_) => match self.tls.process_new_packets() {
                Err(tls) => self.protocol_error(tls),
                Ok(_) => error,
            },
            Err(_) => error,
        }
    }
}

fn peer_gone(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Ok(0) here means the peer sent close_notify
            match self.tls.reader().read(buf) {
                Ok(n) => {
                    self.established |= n > 0;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            let read = self.tls.read_tls(&mut self.socket)?;
            if let Err(e) = self.tls.process_new_packets() {
                let _ = self.write_pending();
                return Err(self.protocol_error(e));
            }
            match self.write_pending() {
                Err(e) if peer_gone(&e) => tracing::debug!("Peer stopped reading: {}", e),
                other => other?,
            }

            if read == 0 {
                return match self.tls.reader().read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    other => other,
                };
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        self.write_pending().map_err(|e| self.surface_alert(e))?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        self.write_pending().map_err(|e| self.surface_alert(e))?;
        self.socket.flush()
    }
}

impl PeerCredentialSource for TlsStream {
    fn peer_credentials(&self) -> Result<ClientCredentials> {
        self.socket.peer_credentials()
    }
}

impl SessionStream for TlsStream {
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_io_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.tls.send_close_notify();
        if let Err(e) = self.write_pending() {
            tracing::debug!("Failed to send close_notify: {}", e);
        }
        self.socket.shutdown()
    }
}
