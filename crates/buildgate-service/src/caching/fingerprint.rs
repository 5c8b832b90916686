use std::fmt;

use sha2::{Digest, Sha256};

/// A SHA-256 digest of a serialized request, used as the key of a decision cache entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Hashes a serialized request.
///
/// The raw request usually contains credentials, so callers should drop it as soon as they no
/// longer need it and keep only the fingerprint around.
pub fn fingerprint(request: &[u8]) -> Fingerprint {
    Fingerprint(Sha256::digest(request).into())
}
