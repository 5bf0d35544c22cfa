use std::{
    fs,
    io::{self, Read, Write},
    net::Shutdown,
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

// cfg for platforms exposing SO_PEERCRED
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::error::{MemguardedError, Result};

/// Owner read/write only
pub const SOCKET_MODE: u32 = 0o600;

/// Credentials of the process at the other end of a local socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Process ID of the peer, when the platform reports it
    pub pid: Option<u32>,
    /// Effective user ID of the peer
    pub uid: u32,
}

/// Transports able to report the OS identity of their peer
pub trait PeerCredentialSource {
    /// Fails with [`MemguardedError::CredentialUnavailable`] on platforms that
    /// cannot report peer credentials at all.
    fn peer_credentials(&self) -> Result<ClientCredentials>;
}

/// Byte stream a protocol session runs over
pub trait SessionStream: Read + Write + PeerCredentialSource + Send {
    /// Bound every following read and write; `None` blocks forever
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close the write direction; reads keep working until the peer closes
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Unix domain socket connection
#[derive(Debug)]
pub struct LocalStream {
    stream: UnixStream,
}

impl LocalStream {
    /// Connect to the daemon socket at `path`
    pub fn connect(path: &Path) -> Result<Self> {
        tracing::debug!("Connecting to Unix socket: {}", path.display());

        let stream = UnixStream::connect(path).map_err(|e| {
            let hint = match e.kind() {
                io::ErrorKind::NotFound => "socket not found, the server may not be running",
                io::ErrorKind::PermissionDenied => {
                    "permission denied, the socket belongs to another user"
                }
                io::ErrorKind::ConnectionRefused => {
                    "connection refused, the server may be stopping"
                }
                _ => "connection failed",
            };
            MemguardedError::io(format!("connecting to {} ({hint})", path.display()), e)
        })?;

        tracing::debug!("Connected to Unix socket");
        Ok(Self { stream })
    }

    fn from_accepted(stream: UnixStream) -> Result<Self> {
        // accepted sockets may inherit the listener's non-blocking flag
        stream
            .set_nonblocking(false)
            .map_err(|e| MemguardedError::io("setting connection to blocking mode", e))?;
        Ok(Self { stream })
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl PeerCredentialSource for LocalStream {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn peer_credentials(&self) -> Result<ClientCredentials> {
        let creds = getsockopt(&self.stream, PeerCredentials)
            .map_err(|e| MemguardedError::io("reading peer credentials", e.into()))?;

        Ok(ClientCredentials {
            pid: u32::try_from(creds.pid()).ok(),
            uid: creds.uid(),
        })
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    fn peer_credentials(&self) -> Result<ClientCredentials> {
        use std::os::unix::io::AsRawFd;

        let fd = self.stream.as_raw_fd();
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        // SAFETY: fd is a live socket owned by self.stream and uid/gid are valid
        // stack locations for getpeereid to fill.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
        if result != 0 {
            return Err(MemguardedError::io(
                "reading peer credentials",
                io::Error::last_os_error(),
            ));
        }

        Ok(ClientCredentials {
            pid: peer_pid(fd),
            uid,
        })
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )))]
    fn peer_credentials(&self) -> Result<ClientCredentials> {
        Err(MemguardedError::CredentialUnavailable(
            "neither SO_PEERCRED nor getpeereid is available on this platform".to_string(),
        ))
    }
}

/// LOCAL_PEERPID is macOS specific
#[cfg(target_os = "macos")]
fn peer_pid(fd: std::os::unix::io::RawFd) -> Option<u32> {
    let mut pid: libc::pid_t = 0;
    let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

    // SAFETY: fd is a live socket and pid/len describe a valid pid_t buffer.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 {
        u32::try_from(pid).ok()
    } else {
        None
    }
}

#[cfg(any(
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn peer_pid(_fd: std::os::unix::io::RawFd) -> Option<u32> {
    None
}

impl SessionStream for LocalStream {
    fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Unix domain socket listener owning its filesystem artifact.
///
/// The socket file is removed when the listener is dropped.
#[derive(Debug)]
pub struct LocalListener {
    listener: UnixListener,
    path:     PathBuf,
}

impl LocalListener {
    /// Bind to `path`, replacing a stale socket left by an unclean shutdown, and
    /// restrict the socket to its owner.
    pub fn bind(path: &Path) -> Result<Self> {
        tracing::info!("Setting up Unix socket server: {}", path.display());

        remove_stale_socket(path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let metadata = fs::metadata(parent).map_err(|e| {
                MemguardedError::io(format!("accessing socket directory {}", parent.display()), e)
            })?;
            if !metadata.is_dir() {
                return Err(MemguardedError::io(
                    format!("binding {}", path.display()),
                    io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("{} is not a directory", parent.display()),
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            let hint = match e.kind() {
                io::ErrorKind::PermissionDenied => "check the socket directory permissions",
                io::ErrorKind::AddrInUse => "another server may be running",
                io::ErrorKind::InvalidInput => "the path may be too long",
                _ => "unexpected error",
            };
            MemguardedError::io(format!("binding {} ({hint})", path.display()), e)
        })?;

        let listener = Self {
            listener,
            path: path.to_path_buf(),
        };

        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
            MemguardedError::io(format!("setting permissions on {}", path.display()), e)
        })?;
        tracing::debug!("Socket permissions set to {:o}", SOCKET_MODE);

        listener
            .listener
            .set_nonblocking(true)
            .map_err(|e| MemguardedError::io("setting listener to non-blocking mode", e))?;

        tracing::info!("Unix socket server setup complete");
        Ok(listener)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one pending connection. When none is pending, waits `poll` and
    /// returns `None` so the caller can check for a stop request.
    pub fn accept_timeout(&self, poll: Duration) -> Result<Option<LocalStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => LocalStream::from_accepted(stream).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(poll);
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(MemguardedError::io("accepting connection", e)),
        }
    }

    /// Check the socket is still a socket with owner-only permissions
    pub fn verify_permissions(&self) -> Result<()> {
        let metadata = fs::symlink_metadata(&self.path).map_err(|e| {
            MemguardedError::io(format!("reading socket status of {}", self.path.display()), e)
        })?;

        let mode = metadata.permissions().mode() & 0o777;
        if !metadata.file_type().is_socket() || mode != SOCKET_MODE {
            return Err(MemguardedError::io(
                format!("verifying socket {}", self.path.display()),
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("socket mode changed to {mode:o}, expected {SOCKET_MODE:o}"),
                ),
            ));
        }
        Ok(())
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed socket {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove socket {}: {}", self.path.display(), e),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            tracing::warn!("Existing socket file found, removing it...");
            fs::remove_file(path).map_err(|e| {
                MemguardedError::io(format!("removing stale socket {}", path.display()), e)
            })?;
            tracing::info!("Old socket file removed successfully");
            Ok(())
        }
        Ok(_) => Err(MemguardedError::io(
            format!("binding {}", path.display()),
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists and is not a socket, refusing to remove it",
            ),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("No existing socket file found");
            Ok(())
        }
        Err(e) => Err(MemguardedError::io(format!("inspecting {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_one(listener: &LocalListener) -> LocalStream {
        for _ in 0..500 {
            if let Some(stream) = listener.accept_timeout(Duration::from_millis(10)).unwrap() {
                return stream;
            }
        }
        panic!("no connection accepted");
    }

    #[test]
    fn bind_sets_owner_only_permissions_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let listener = LocalListener::bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
        listener.verify_permissions().unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");

        // a bound std listener leaves its file behind when dropped
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let _listener = LocalListener::bind(&path).unwrap();
        assert!(LocalStream::connect(&path).is_ok());
    }

    #[test]
    fn bind_refuses_to_remove_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"data").unwrap();

        assert!(LocalListener::bind(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn tampered_permissions_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tamper.sock");
        let listener = LocalListener::bind(&path).unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
        assert!(listener.verify_permissions().is_err());
    }

    #[test]
    fn peer_credentials_report_own_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = LocalStream::connect(&path).unwrap();
        let server = accept_one(&listener);

        // SAFETY: getuid has no preconditions
        let uid = unsafe { libc::getuid() };
        assert_eq!(server.peer_credentials().unwrap().uid, uid);
        assert_eq!(client.peer_credentials().unwrap().uid, uid);
    }
}
