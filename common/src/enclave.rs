//! Sealed in-process storage for secret bytes.
//!
//! An [`Enclave`] keeps its bytes encrypted with XChaCha20-Poly1305 under a key
//! generated for that enclave alone. Plaintext only exists inside an
//! [`OpenEnclave`] guard, which wipes (and unlocks) its pages when dropped.

use std::fmt;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{MemguardedError, Result};

/// Enclave key length (256-bit)
pub const KEY_LEN: usize = 32;

/// Nonce length for XChaCha20-Poly1305
pub const NONCE_LEN: usize = 24;

/// Sealed representation of a secret. Not `Clone`: copies go through
/// [`Enclave::try_clone`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Enclave {
    key:    [u8; KEY_LEN],
    nonce:  [u8; NONCE_LEN],
    sealed: Vec<u8>,
    len:    usize,
}

impl Enclave {
    /// Seals `plaintext` and overwrites it with zeros, whatever the outcome
    pub fn seal(plaintext: &mut [u8]) -> Result<Self> {
        let enclave = Self::seal_copy(plaintext);
        plaintext.zeroize();
        enclave
    }

    /// Seals a copy of `plaintext`, leaving the input untouched
    pub fn seal_copy(plaintext: &[u8]) -> Result<Self> {
        let mut enclave = Self {
            key:    [0u8; KEY_LEN],
            nonce:  [0u8; NONCE_LEN],
            sealed: Vec::with_capacity(plaintext.len() + 16),
            len:    plaintext.len(),
        };

        let mut rng = rand::thread_rng();
        rng.fill(&mut enclave.key[..]);
        rng.fill(&mut enclave.nonce[..]);

        enclave.sealed.extend_from_slice(plaintext);
        let cipher = XChaCha20Poly1305::new((&enclave.key).into());
        cipher
            .encrypt_in_place(XNonce::from_slice(&enclave.nonce), b"", &mut enclave.sealed)
            .map_err(|_| MemguardedError::Sealing("seal"))?;

        Ok(enclave)
    }

    /// Decrypts into a transient view. The view is wiped on drop.
    pub fn open(&self) -> Result<OpenEnclave> {
        let mut plaintext = Zeroizing::new(self.sealed.clone());
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt_in_place(XNonce::from_slice(&self.nonce), b"", &mut *plaintext)
            .map_err(|_| MemguardedError::Sealing("open"))?;

        Ok(OpenEnclave::new(plaintext))
    }

    /// Explicit copy, re-sealed under a fresh key
    pub fn try_clone(&self) -> Result<Self> {
        let view = self.open()?;
        Self::seal_copy(view.bytes())
    }

    /// Length of the plaintext
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Enclave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enclave").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Transient plaintext view of an [`Enclave`]
pub struct OpenEnclave {
    bytes:  Zeroizing<Vec<u8>>,
    locked: Option<(usize, usize)>,
}

impl OpenEnclave {
    fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        let locked = lock_pages(&bytes);
        Self { bytes, locked }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for OpenEnclave {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for OpenEnclave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenEnclave").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}

impl Drop for OpenEnclave {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if let Some((addr, len)) = self.locked.take() {
            unlock_pages(addr, len);
        }
    }
}

/// Keep the plaintext out of swap while it is open. Best effort: `RLIMIT_MEMLOCK`
/// may refuse, in which case the view is still wiped on drop.
#[cfg(unix)]
fn lock_pages(bytes: &[u8]) -> Option<(usize, usize)> {
    if bytes.is_empty() {
        return None;
    }

    // SAFETY: the pointer and length describe a live allocation owned by the
    // view; mlock does not read or write the memory.
    let result = unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if result == 0 {
        Some((bytes.as_ptr() as usize, bytes.len()))
    } else {
        tracing::debug!(
            "mlock of open enclave failed: {}",
            std::io::Error::last_os_error()
        );
        None
    }
}

#[cfg(unix)]
fn unlock_pages(addr: usize, len: usize) {
    // SAFETY: the range was locked by lock_pages and its allocation is still
    // alive (it is released after this call).
    unsafe {
        libc::munlock(addr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn lock_pages(_bytes: &[u8]) -> Option<(usize, usize)> {
    None
}

#[cfg(not(unix))]
fn unlock_pages(_addr: usize, _len: usize) {}
