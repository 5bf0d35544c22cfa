//! Per-connection protocol session.
//!
//! `Accepted → Authenticating → Authorized → ReadingCommand → Dispatching`, looping
//! back to `ReadingCommand` after every successful handler and ending in `Closed`
//! on end of stream or on the first error.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use memguarded_common::{
    error::{MemguardedError, Result},
    platform_socket::{ClientCredentials, LocalStream, SessionStream},
    protocol::{read_command, DeadlineStream},
    store::SecretStore,
    tls_stream::TlsStream,
};

use crate::{
    auth::PeerAuthenticator, commands::CommandRegistry, gate::GatePassword, server::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Authenticating,
    Authorized,
    ReadingCommand,
    Dispatching,
    Closed,
}

pub struct Session {
    stream:    Box<dyn SessionStream>,
    state:     SessionState,
    gate:      Option<Arc<GatePassword>>,
    gate_open: bool,
    timeout:   Duration,
    deadline:  Instant,
    peer:      Option<ClientCredentials>,
}

impl Session {
    /// Wrap an already established stream. Without a gate password every
    /// command is open.
    pub fn new(
        stream: Box<dyn SessionStream>,
        timeout: Duration,
        gate: Option<Arc<GatePassword>>,
    ) -> Self {
        Self {
            stream,
            state: SessionState::Accepted,
            gate_open: gate.is_none(),
            gate,
            timeout,
            deadline: Instant::now() + timeout,
            peer: None,
        }
    }

    /// Run the transport handshake on a freshly accepted socket
    pub fn establish(
        socket: LocalStream,
        transport: &Transport,
        timeout: Duration,
        gate: Option<Arc<GatePassword>>,
    ) -> Result<Self> {
        socket
            .set_io_timeout(Some(timeout))
            .map_err(|e| MemguardedError::io("setting handshake timeout", e))?;

        let stream: Box<dyn SessionStream> = match transport {
            Transport::Plain => Box::new(socket),
            Transport::Tls(config) => {
                let stream = TlsStream::accept(socket, config.shared())?;
                tracing::info!("✓ TLS connection established with client certificate verification");
                Box::new(stream)
            }
        };

        let mut session = Self::new(stream, timeout, gate);
        session.transition(SessionState::Authenticating);
        Ok(session)
    }

    /// Check the peer before anything is read from it
    pub fn authorize(&mut self, authenticator: &PeerAuthenticator) -> Result<()> {
        match authenticator.authenticate(&*self.stream) {
            Ok(peer) => {
                self.peer = peer;
                self.transition(SessionState::Authorized);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Process commands until the peer disconnects or a command fails. The
    /// stream is shut down either way.
    pub fn run(&mut self, registry: &CommandRegistry, store: &SecretStore) -> Result<()> {
        let result = self.command_loop(registry, store);
        self.close();
        result
    }

    fn command_loop(&mut self, registry: &CommandRegistry, store: &SecretStore) -> Result<()> {
        if self.state != SessionState::Authorized {
            return Err(MemguardedError::CredentialUnavailable(
                "session was not authorized".to_string(),
            ));
        }

        loop {
            self.transition(SessionState::ReadingCommand);
            self.deadline = Instant::now() + self.timeout;

            let Some(line) = read_command(&mut self.stream())? else {
                tracing::debug!("Client disconnected");
                return Ok(());
            };

            let handler = registry
                .get(&line.name)
                .ok_or_else(|| MemguardedError::UnknownCommand(line.name.clone()))?;

            self.transition(SessionState::Dispatching);
            tracing::debug!("Dispatching `{}`", line.name);
            handler(self, store, line.delimiter)?;
        }
    }

    /// Stream bounded by the deadline of the current iteration
    pub fn stream(&mut self) -> DeadlineStream<'_> {
        DeadlineStream::with_deadline(self.stream.as_mut(), self.deadline)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<ClientCredentials> {
        self.peer
    }

    pub fn is_gate_open(&self) -> bool {
        self.gate_open
    }

    pub fn ensure_gate_open(&self) -> Result<()> {
        if self.gate_open {
            Ok(())
        } else {
            Err(MemguardedError::GateNotOpen)
        }
    }

    /// Open the gate when `candidate` matches the shared password, close it
    /// otherwise
    pub fn present_password(&mut self, candidate: &[u8]) -> Result<()> {
        let Some(gate) = &self.gate else {
            tracing::debug!("No socket password configured, ignoring `socket_password`");
            return Ok(());
        };

        self.gate_open = gate.verify(candidate);
        if self.gate_open {
            tracing::debug!("✓ Socket password accepted");
            Ok(())
        } else {
            Err(MemguardedError::GateRejected)
        }
    }

    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.stream.shutdown() {
            tracing::debug!("Failed to shut down connection: {}", e);
        }
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!("Session {:?} → {:?}", self.state, next);
        self.state = next;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("gate_open", &self.gate_open)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
