use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One-way SHA-256 digest of a presented credential secret.
///
/// The digest is the only form in which a secret is ever cached, stored as a
/// lookup key, or written to logs. `Debug` and `Display` print a short prefix.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretDigest(String);

impl SecretDigest {
    /// Hash a raw secret into its lowercase hex digest.
    #[must_use]
    pub fn of(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Full hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log fields.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Debug for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretDigest({}…)", self.short())
    }
}

impl fmt::Display for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}
