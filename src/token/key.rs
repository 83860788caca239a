//! Token key derivation.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::config::MIN_SALT_LEN;
use crate::error::{GuardError, Result};

/// AES-256 key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 rounds applied to the password.
pub const PBKDF2_ROUNDS: u32 = 1001;

/// Symmetric key derived from a password and salt, wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    /// Derive the key with PBKDF2-HMAC-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Config`] if the password is empty or the salt is
    /// shorter than 16 bytes.
    pub fn derive(password: &[u8], salt: &[u8]) -> Result<Self> {
        if password.is_empty() {
            return Err(GuardError::Config(
                "unable to derive a token key without a password".to_string(),
            ));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(GuardError::Config(format!(
                "the given salt is too short ({} bytes), use at least {} bytes",
                salt.len(),
                MIN_SALT_LEN
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ROUNDS, &mut bytes);
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}
