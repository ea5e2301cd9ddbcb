// src/sys/secrets.rs

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, Secret};

/// Memory-safe wrapper for the backend session secret and inline private-key PEM.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. The buffer is zeroized when dropped.
pub struct SecretValue {
    value: Secret<String>,
}

impl SecretValue {
    pub fn new(raw: String) -> Self {
        Self {
            value: Secret::new(raw),
        }
    }

    /// 32 bytes from the OS RNG, hex encoded.
    pub fn generate_session_secret() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let encoded = hex::encode(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        Self::new(encoded)
    }

    /// Exposes the plaintext only inside the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.value.expose_secret())
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }
}

impl Clone for SecretValue {
    fn clone(&self) -> Self {
        Self::new(self.value.expose_secret().clone())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([REDACTED])")
    }
}
