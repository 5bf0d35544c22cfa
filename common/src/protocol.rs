//! Line-oriented command protocol: `<command>[ <payload>]\n`.

use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use crate::{
    error::{MemguardedError, Result},
    platform_socket::SessionStream,
};

/// Opens the gate with the shared socket password
pub const SOCKET_PASSWORD: &str = "socket_password";
/// Replaces the stored secret with the payload
pub const SET_SECRET: &str = "set_secret";
/// Returns the stored secret followed by a newline
pub const GET_SECRET: &str = "get_secret";

/// Ends every command line and every reply
pub const TERMINATOR: u8 = b'\n';

/// Longest accepted command token
pub const MAX_TOKEN_LEN: usize = 64;

/// What ended a command token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// A payload follows on the same line
    Space,
    /// The line ended, no payload
    Newline,
}

impl Delimiter {
    pub fn has_payload(self) -> bool {
        matches!(self, Delimiter::Space)
    }
}

/// A command token read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub name:      String,
    pub delimiter: Delimiter,
}

/// Write every byte of `bytes`, looping over partial writes
pub fn write_bytes<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let mut total = 0;
    while total < bytes.len() {
        match writer.write(&bytes[total..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection accepted no more bytes",
                ))
            }
            Ok(written) => total += written,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write a full command line and flush it.
///
/// The payload is written in place, never concatenated into a temporary buffer.
pub fn write_command<W: Write + ?Sized>(
    writer: &mut W,
    command: &str,
    payload: Option<&[u8]>,
) -> Result<()> {
    let context = || format!("writing `{command}`");

    write_bytes(writer, command.as_bytes()).map_err(|e| MemguardedError::io(context(), e))?;
    if let Some(payload) = payload {
        write_bytes(writer, b" ").map_err(|e| MemguardedError::io(context(), e))?;
        write_bytes(writer, payload).map_err(|e| MemguardedError::io(context(), e))?;
    }
    write_bytes(writer, &[TERMINATOR]).map_err(|e| MemguardedError::io(context(), e))?;
    writer.flush().map_err(|e| MemguardedError::io(context(), e))
}

/// Read a command token one byte at a time.
///
/// Returns `None` when the stream ends before any byte of a new command.
pub fn read_command<R: Read + ?Sized>(reader: &mut R) -> Result<Option<CommandLine>> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) if token.is_empty() => return Ok(None),
            Ok(0) => {
                return Err(MemguardedError::io(
                    "reading command",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-command"),
                ))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(MemguardedError::io("reading command", e)),
        }

        let delimiter = match byte[0] {
            b' ' => Delimiter::Space,
            TERMINATOR => Delimiter::Newline,
            other => {
                if token.len() == MAX_TOKEN_LEN {
                    return Err(MemguardedError::MalformedCommand(format!(
                        "command token longer than {MAX_TOKEN_LEN} bytes"
                    )));
                }
                token.push(other);
                continue;
            }
        };

        return Ok(Some(CommandLine {
            name: String::from_utf8_lossy(&token).into_owned(),
            delimiter,
        }));
    }
}

/// Applies one absolute deadline to every read and write of a session
/// iteration, shrinking the socket timeout as the deadline approaches.
pub struct DeadlineStream<'a> {
    inner:    &'a mut dyn SessionStream,
    deadline: Instant,
}

impl<'a> DeadlineStream<'a> {
    pub fn new(inner: &'a mut dyn SessionStream, timeout: Duration) -> Self {
        Self::with_deadline(inner, Instant::now() + timeout)
    }

    pub fn with_deadline(inner: &'a mut dyn SessionStream, deadline: Instant) -> Self {
        Self { inner, deadline }
    }

    fn arm(&self) -> io::Result<()> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"));
        }
        self.inner.set_io_timeout(Some(remaining))
    }
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.arm()?;
        self.inner.flush()
    }
}
