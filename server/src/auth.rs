use std::{fs, io, path::PathBuf};

use memguarded_common::{
    error::{MemguardedError, Result},
    platform_socket::{ClientCredentials, PeerCredentialSource},
};
use sha2::{Digest, Sha256};

/// Decides whether the process at the other end of a connection may talk to
/// the daemon. Runs once per connection, before any command is read.
#[derive(Debug, Clone)]
pub struct PeerAuthenticator {
    expected_uid: u32,
    pins:         Option<ExecutablePins>,
}

impl Default for PeerAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerAuthenticator {
    /// Accept peers running as the daemon's own user
    pub fn new() -> Self {
        // SAFETY: getuid() is always safe to call and returns the real user ID
        let uid = unsafe { libc::getuid() };
        Self::with_expected_uid(uid)
    }

    pub fn with_expected_uid(expected_uid: u32) -> Self {
        Self {
            expected_uid,
            pins: None,
        }
    }

    /// Additionally require the peer executable's SHA-256 to be one of
    /// `hashes` (hex). An empty list leaves pinning disabled.
    pub fn with_allowed_executables<I, S>(mut self, hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed: Vec<String> = hashes
            .into_iter()
            .map(|hash| hash.as_ref().trim().to_ascii_lowercase())
            .filter(|hash| !hash.is_empty())
            .collect();

        self.pins = (!allowed.is_empty()).then_some(ExecutablePins { allowed });
        self
    }

    pub fn expected_uid(&self) -> u32 {
        self.expected_uid
    }

    /// Check the peer of `source`.
    ///
    /// Returns `None` when the platform cannot report credentials at all. The
    /// connection is then admitted in reduced-assurance mode, unless executable
    /// pinning is enabled.
    pub fn authenticate<S: PeerCredentialSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<Option<ClientCredentials>> {
        let credentials = match source.peer_credentials() {
            Ok(credentials) => credentials,
            Err(MemguardedError::CredentialUnavailable(reason)) if self.pins.is_none() => {
                tracing::warn!(
                    "⚠️  Peer credentials unavailable ({}), admitting without a uid check",
                    reason
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::debug!("Client PID: {:?}, UID: {}", credentials.pid, credentials.uid);

        if credentials.uid != self.expected_uid {
            return Err(MemguardedError::Unauthorized {
                uid:      credentials.uid,
                expected: self.expected_uid,
            });
        }
        tracing::debug!("✓ Client UID {} matches expected UID", credentials.uid);

        if let Some(pins) = &self.pins {
            let pid = credentials.pid.ok_or_else(|| {
                MemguardedError::CredentialUnavailable(
                    "peer pid is required for executable pinning".to_string(),
                )
            })?;
            pins.verify(pid)?;
        }

        Ok(Some(credentials))
    }
}

#[derive(Debug, Clone)]
struct ExecutablePins {
    allowed: Vec<String>,
}

impl ExecutablePins {
    fn verify(&self, pid: u32) -> Result<()> {
        let exe_path = process_executable_path(pid)
            .map_err(|e| MemguardedError::io(format!("locating executable of pid {pid}"), e))?;
        tracing::debug!("Verifying binary: {:?}", exe_path);

        let digest = hash_file(&exe_path)
            .map_err(|e| MemguardedError::io(format!("hashing {}", exe_path.display()), e))?;

        if self.allowed.iter().any(|allowed| *allowed == digest) {
            tracing::debug!("✓ Binary hash verification passed");
            Ok(())
        } else {
            tracing::error!("Binary hash mismatch for {:?}", exe_path);
            tracing::error!("Computed: {}", digest);
            Err(MemguardedError::UntrustedExecutable { pid })
        }
    }
}

fn hash_file(path: &std::path::Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_executable_path(pid: u32) -> io::Result<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe"))
}

#[cfg(target_os = "macos")]
fn process_executable_path(pid: u32) -> io::Result<PathBuf> {
    use std::ffi::CStr;

    // PROC_PIDPATHINFO_MAXSIZE
    let mut path_buf = [0 as libc::c_char; 4096];
    let pid = libc::c_int::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: path_buf is a valid stack buffer and its length matches the size
    // parameter.
    let ret = unsafe {
        libc::proc_pidpath(
            pid,
            path_buf.as_mut_ptr() as *mut libc::c_void,
            path_buf.len() as u32,
        )
    };
    if ret <= 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: proc_pidpath null-terminates the path when it returns > 0
    let path = unsafe { CStr::from_ptr(path_buf.as_ptr()) };
    let path = path
        .to_str()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(PathBuf::from(path))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn process_executable_path(pid: u32) -> io::Result<PathBuf> {
    let proc_path = format!("/proc/{pid}/exe");
    fs::read_link(&proc_path).map_err(|_| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "executable lookup is supported on Linux (/proc/*/exe) and macOS (proc_pidpath)",
        )
    })
}
