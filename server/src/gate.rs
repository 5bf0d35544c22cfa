use std::fmt;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Shared password that must be presented with `socket_password` before any
/// gated command. Only its SHA-256 digest is kept.
pub struct GatePassword {
    digest: Zeroizing<[u8; 32]>,
}

impl GatePassword {
    pub fn new(password: &[u8]) -> Self {
        Self {
            digest: digest(password),
        }
    }

    /// Compare `candidate` against the configured password in constant time
    pub fn verify(&self, candidate: &[u8]) -> bool {
        let candidate = digest(candidate);
        self.digest[..].ct_eq(&candidate[..]).into()
    }
}

fn digest(bytes: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(Sha256::digest(bytes).into())
}

impl fmt::Debug for GatePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GatePassword(..)")
    }
}
