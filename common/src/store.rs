//! The secret store: zero or one sealed secret plus change watchers.

use std::{
    collections::HashMap,
    fmt,
    io::{self, Read, Write},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    enclave::{Enclave, OpenEnclave},
    error::{MemguardedError, Result},
    prompt::{stdin_is_terminal, SecretPrompt, TerminalPrompt},
    protocol::write_bytes,
};

/// Upper bound for a secret read from a stream
pub const MAX_SECRET_LEN: usize = 64 * 1024;

const INITIAL_CAPACITY: usize = 64;

/// How [`read_secret_until`] stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The terminator byte was consumed
    Terminator,
    /// The stream ended first
    EndOfStream,
}

/// Subscription to secret replacements.
///
/// Each handle has a single notification slot: replacements that happen while a
/// notification is still pending are coalesced into it.
pub struct WatchHandle {
    id:       Uuid,
    receiver: Receiver<()>,
}

impl WatchHandle {
    /// Consume a pending notification, if any
    pub fn try_recv(&self) -> bool {
        self.receiver.try_recv().is_ok()
    }

    /// Wait up to `timeout` for a notification
    pub fn recv_timeout(&self, timeout: Duration) -> bool {
        self.receiver.recv_timeout(timeout).is_ok()
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct StoreState {
    enclave:  Option<Enclave>,
    watchers: HashMap<Uuid, Sender<()>>,
}

/// Holds at most one sealed secret.
///
/// Replacement and watcher fan-out happen under one write lock, so readers see
/// either the previous or the new secret and every watcher registered at the
/// time of a replacement has its slot filled before `set_*` returns.
#[derive(Default)]
pub struct SecretStore {
    state: RwLock<StoreState>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `plaintext` as the new secret. The buffer is zeroed before returning.
    pub fn set_from_bytes(&self, plaintext: &mut [u8]) -> Result<()> {
        let enclave = Enclave::seal(plaintext)?;
        self.replace(enclave);
        Ok(())
    }

    /// Read a secret up to, and excluding, `terminator`.
    ///
    /// A stream that ends before the terminator stores everything read so far.
    pub fn set_from_stream<R: Read + ?Sized>(&self, reader: &mut R, terminator: u8) -> Result<()> {
        let (mut secret, _) = read_secret_until(reader, terminator)?;
        self.set_from_bytes(&mut secret)
    }

    /// Write the secret to `writer`.
    ///
    /// The transient view is wiped whether or not the write succeeds. Bytes
    /// already written before a failure stay written.
    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let view = self.open()?;
        write_bytes(writer, view.bytes()).map_err(|e| MemguardedError::io("writing secret", e))
    }

    /// Open a transient plaintext view of the secret
    pub fn open(&self) -> Result<OpenEnclave> {
        match &self.read_state().enclave {
            Some(enclave) => enclave.open(),
            None => Err(MemguardedError::NotSet),
        }
    }

    /// Reader over a transient view of the secret, `None` when nothing is stored
    pub fn reader(&self) -> Option<SecretReader> {
        self.open().ok().map(|view| SecretReader { view, position: 0 })
    }

    pub fn is_set(&self) -> bool {
        self.read_state().enclave.is_some()
    }

    /// Register a watcher notified on every replacement
    pub fn watch(&self) -> WatchHandle {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let id = Uuid::new_v4();
        self.write_state().watchers.insert(id, sender);
        tracing::debug!("Watcher {} registered", id);
        WatchHandle { id, receiver }
    }

    /// Remove a watcher. Returns whether it was registered.
    pub fn unwatch(&self, handle: &WatchHandle) -> bool {
        let removed = self.write_state().watchers.remove(&handle.id).is_some();
        tracing::debug!("Watcher {} removed", handle.id);
        removed
    }

    /// Drop the stored secret, wiping its sealed bytes and key
    pub fn purge(&self) {
        if self.write_state().enclave.take().is_some() {
            tracing::debug!("Secret purged");
        }
    }

    /// Ask for the secret on the terminal, twice when `confirm` is set
    pub fn ask_secret(&self, confirm: bool, label: &str) -> Result<()> {
        if !stdin_is_terminal() {
            return Err(MemguardedError::NoTerminal);
        }
        self.set_from_prompt(&mut TerminalPrompt, confirm, label)
    }

    /// Read the secret from `prompt`.
    ///
    /// With `confirm`, both entries must match and be non-empty; otherwise the
    /// prompt repeats.
    pub fn set_from_prompt<P: SecretPrompt + ?Sized>(
        &self,
        prompt: &mut P,
        confirm: bool,
        label: &str,
    ) -> Result<()> {
        let read = |prompt: &mut P, label: &str| {
            prompt
                .read_secret(label)
                .map_err(|e| MemguardedError::io("reading secret from terminal", e))
        };

        loop {
            let secret = read(prompt, label)?;
            if !confirm {
                self.replace(Enclave::seal_copy(secret.as_bytes())?);
                return Ok(());
            }

            let confirmation = read(prompt, "Confirm")?;
            if !secret.is_empty() && secret.as_bytes() == confirmation.as_bytes() {
                self.replace(Enclave::seal_copy(secret.as_bytes())?);
                return Ok(());
            }

            prompt.notice("Empty secret or entries do not match...");
        }
    }

    fn replace(&self, enclave: Enclave) {
        let mut state = self.write_state();
        state.enclave = Some(enclave);
        state.watchers.retain(|id, sender| match sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => {
                tracing::debug!("Dropping watcher {} with no receiver", id);
                false
            }
        });
        tracing::debug!("Secret set, {} watcher(s) notified", state.watchers.len());
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("SecretStore")
            .field("set", &state.enclave.is_some())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

/// `io::Read` over a transient view; the view is wiped when the reader drops
pub struct SecretReader {
    view:     OpenEnclave,
    position: usize,
}

impl Read for SecretReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.view.bytes()[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Read bytes up to `terminator` into a buffer that is wiped on drop.
///
/// Reads one byte at a time so nothing past the terminator is consumed. When
/// the buffer grows, the previous allocation is wiped before release.
pub fn read_secret_until<R: Read + ?Sized>(
    reader: &mut R,
    terminator: u8,
) -> Result<(Zeroizing<Vec<u8>>, Termination)> {
    let mut secret = Zeroizing::new(Vec::with_capacity(INITIAL_CAPACITY));
    let mut byte = Zeroizing::new([0u8; 1]);

    loop {
        match reader.read(&mut byte[..]) {
            Ok(0) => return Ok((secret, Termination::EndOfStream)),
            Ok(_) if byte[0] == terminator => return Ok((secret, Termination::Terminator)),
            Ok(_) => {
                if secret.len() == MAX_SECRET_LEN {
                    return Err(MemguardedError::MalformedCommand(format!(
                        "secret longer than {MAX_SECRET_LEN} bytes"
                    )));
                }
                if secret.len() == secret.capacity() {
                    let mut grown = Zeroizing::new(Vec::with_capacity(secret.capacity() * 2));
                    grown.extend_from_slice(&secret);
                    secret = grown;
                }
                secret.push(byte[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(MemguardedError::io("reading secret", e)),
        }
    }
}
