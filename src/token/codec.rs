//! Token sealing and opening.
//!
//! Wire format, outermost first:
//!
//! ```text
//! percent-encode( base64( raw-deflate( iv[12] || tag[16] || ciphertext ) ) )
//! ```
//!
//! The ciphertext is AES-256-GCM over the JSON claims. Decoding authenticates
//! before anything is parsed and collapses every failure into
//! [`GuardError::DecodeFailure`]; the specific cause is only logged.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, DecompressError, FlushDecompress, Status};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use thiserror::Error;
use tracing::debug;

use super::key::KeyMaterial;
use super::principal::{Expiration, PathPattern, Principal};
use crate::config::AuthConfig;
use crate::error::{GuardError, Result};
use crate::ratelimit::{parse_rate, RateSpec};

/// AES-GCM initialization vector size (96 bits).
pub const IV_SIZE: usize = 12;

/// GCM authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Fixed prefix of every sealed payload.
pub const HEADER_SIZE: usize = IV_SIZE + TAG_SIZE;

/// Upper bound on the inflated payload of a token.
pub const MAX_SEALED_SIZE: usize = 64 * 1024;

/// Everything `encodeURIComponent` escapes.
const TOKEN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const RESERVED_CLAIMS: [&str; 4] = ["id", "path", "rate", "exp"];

/// Internal decode failure causes. Never leaves this module.
#[derive(Debug, Error)]
enum DecodeCause {
    #[error("token is not percent-encoded base64")]
    Encoding,
    #[error("token escapes are not in canonical form")]
    NonCanonical,
    #[error("corrupt deflate stream: {0}")]
    Inflate(DecompressError),
    #[error("deflate stream is truncated or followed by trailing data")]
    Incomplete,
    #[error("inflated payload exceeds {max} bytes", max = MAX_SEALED_SIZE)]
    TooLarge,
    #[error("sealed payload of {0} bytes is shorter than the {header}-byte header", header = HEADER_SIZE)]
    Truncated(usize),
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("malformed claims: {0}")]
    Payload(serde_json::Error),
    #[error("stored path pattern does not compile")]
    Pattern,
}

/// Serialized form of a principal.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(deserialize_with = "id_from_string_or_number")]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate: Option<RateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Ids written by other issuers may be JSON numbers.
fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

impl Claims {
    fn from_principal(principal: &Principal, now_millis: i64) -> Result<Self> {
        if let Some(rate) = &principal.rate {
            parse_rate(rate)?;
        }

        let exp = match &principal.exp {
            Some(exp) => {
                let at = exp.resolve()?;
                if at <= now_millis {
                    return Err(GuardError::ExpiredOrInvalidExpiration(at));
                }
                Some(at)
            }
            None => None,
        };

        let extra = principal
            .claims
            .iter()
            .filter(|(key, _)| !RESERVED_CLAIMS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            id: principal.id.clone(),
            path: principal.path.as_ref().map(|p| p.source().to_string()),
            rate: principal.rate.clone(),
            exp,
            extra,
        })
    }

    fn into_principal(self) -> std::result::Result<Principal, DecodeCause> {
        let path = self
            .path
            .map(|source| PathPattern::new(&source))
            .transpose()
            .map_err(|_| DecodeCause::Pattern)?;

        Ok(Principal {
            id: self.id,
            path,
            rate: self.rate,
            exp: self.exp.map(Expiration::EpochMillis),
            claims: self.extra,
        })
    }
}

/// Encodes principals into sealed tokens and back.
///
/// Holds only the cipher keyed at construction; safe to share between
/// threads without locking.
pub struct TokenCodec {
    cipher: Aes256Gcm,
}

impl TokenCodec {
    /// Create a codec from derived key material.
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    /// Derive the key from the auth configuration and create a codec.
    pub fn from_config(auth: &AuthConfig) -> Result<Self> {
        auth.validate()?;
        let key = KeyMaterial::derive(auth.password.as_bytes(), auth.salt.as_bytes())?;
        Ok(Self::new(&key))
    }

    /// Seal a principal into a token.
    ///
    /// # Errors
    ///
    /// Fails if the rate is invalid, or the expiration cannot be parsed or is
    /// not strictly in the future.
    pub fn encode(&self, principal: &Principal) -> Result<String> {
        let claims = Claims::from_principal(principal, Utc::now().timestamp_millis())?;
        let payload = serde_json::to_vec(&claims)?;
        let sealed = self.seal(&payload)?;
        let token = pack(&sealed)?;

        debug!(id = %principal.id, token_len = token.len(), "Issued token");
        Ok(token)
    }

    /// Open a token.
    ///
    /// Every fault yields [`GuardError::DecodeFailure`]. Expiration is not
    /// checked here.
    pub fn decode(&self, token: &str) -> Result<Principal> {
        self.open_token(token).map_err(|cause| {
            debug!(cause = %cause, "Rejected token");
            GuardError::DecodeFailure
        })
    }

    fn open_token(&self, token: &str) -> std::result::Result<Principal, DecodeCause> {
        let sealed = unpack(token)?;
        let payload = self.open(&sealed)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(DecodeCause::Payload)?;
        claims.into_principal()
    }

    /// Encrypt `plaintext` under a fresh IV into `iv || tag || ciphertext`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| GuardError::Encryption(format!("AES-256-GCM encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + buffer.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(tag.as_slice());
        sealed.extend_from_slice(&buffer);
        Ok(sealed)
    }

    /// Verify and decrypt `iv || tag || ciphertext`.
    fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, DecodeCause> {
        if sealed.len() < HEADER_SIZE {
            return Err(DecodeCause::Truncated(sealed.len()));
        }
        let (iv, rest) = sealed.split_at(IV_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| DecodeCause::Authentication)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

/// Compress and text-encode a sealed payload.
fn pack(sealed: &[u8]) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(sealed).map_err(GuardError::Compression)?;
    let compressed = encoder.finish().map_err(GuardError::Compression)?;

    let encoded = BASE64.encode(compressed);
    Ok(utf8_percent_encode(&encoded, TOKEN_ENCODE_SET).to_string())
}

/// Reverse of [`pack`].
///
/// Accepts the escaped form exactly as [`pack`] writes it, or the bare base64
/// of a token whose escapes were already removed by the transport. Any other
/// spelling of the escapes (lowercase hex, escaped alphanumerics, partial
/// escaping) is rejected.
fn unpack(token: &str) -> std::result::Result<Vec<u8>, DecodeCause> {
    let token = token.trim();
    let unescaped = percent_decode_str(token)
        .decode_utf8()
        .map_err(|_| DecodeCause::Encoding)?;
    if unescaped != token && utf8_percent_encode(&unescaped, TOKEN_ENCODE_SET).to_string() != token
    {
        return Err(DecodeCause::NonCanonical);
    }
    let compressed = BASE64
        .decode(unescaped.as_bytes())
        .map_err(|_| DecodeCause::Encoding)?;

    let mut inflater = Decompress::new(false);
    let mut sealed = Vec::with_capacity(MAX_SEALED_SIZE + 1);
    let status = inflater
        .decompress_vec(&compressed, &mut sealed, FlushDecompress::Finish)
        .map_err(DecodeCause::Inflate)?;
    if sealed.len() > MAX_SEALED_SIZE {
        return Err(DecodeCause::TooLarge);
    }
    if status != Status::StreamEnd || inflater.total_in() != compressed.len() as u64 {
        return Err(DecodeCause::Incomplete);
    }
    Ok(sealed)
}
