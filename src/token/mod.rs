//! Sealed, self-contained credentials.

mod codec;
mod key;
mod principal;

pub use codec::{TokenCodec, HEADER_SIZE, IV_SIZE, MAX_SEALED_SIZE, TAG_SIZE};
pub use key::{KeyMaterial, KEY_SIZE, PBKDF2_ROUNDS};
pub use principal::{Expiration, PathPattern, Principal};
