//! Payload Encryption
//!
//! Every payload leaves the agent sealed with AES-256-GCM under a key that is
//! derived fresh for each (tenant, UTC day):
//!
//! ```text
//! info = "nexus-enigma-{tenant_key}-{YYYY-MM-DD}"
//! key  = HKDF-SHA256(ikm = long-term secret, salt = none, info)[..32]
//! ```
//!
//! The receiver recomputes the same key from the public `keyDate` in the
//! envelope, so no per-day key material is ever stored or exchanged. The
//! derivation is a wire contract: it must match other implementations bit
//! for bit.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{NaiveDate, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::credentials::Credential;

/// Length of derived encryption keys (AES-256)
pub const KEY_LENGTH: usize = 32;

/// AES-GCM nonce length (96 bits)
pub const NONCE_LENGTH: usize = 12;

/// Version of the long-term secret schedule. Fixed until secret rotation exists.
pub const SECRET_VERSION: u32 = 1;

/// Domain separation prefix of the HKDF info string
pub const KEY_INFO_PREFIX: &str = "nexus-enigma";

/// Errors produced while sealing a payload
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Long-term secret is not valid base64
    #[error("Invalid secret encoding: {0}")]
    SecretEncoding(String),

    /// Payload cannot be serialized to JSON
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HKDF expand failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// AES-GCM setup or sealing failed
    #[error("Cipher error: {0}")]
    Cipher(String),
}

/// The encrypted, self-describing artifact POSTed upstream
///
/// Carries no key material: `keyDate` and `secretVersion` only tell the
/// receiver which key to re-derive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    pub encrypted: bool,
    pub key_date: NaiveDate,
    pub secret_version: u32,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Ciphertext followed by the 16-byte GCM tag
    #[serde(rename = "data", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Build the HKDF info string for a tenant and day
pub fn key_info(tenant_key: &str, date: NaiveDate) -> String {
    format!("{}-{}-{}", KEY_INFO_PREFIX, tenant_key, date.format("%Y-%m-%d"))
}

/// Decode a base64 long-term secret
pub fn decode_secret(encoded: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    STANDARD
        .decode(encoded.trim())
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::SecretEncoding(e.to_string()))
}

/// Derive the daily key for `tenant_key` on `date`
///
/// Pure function of its inputs.
pub fn derive_daily_key(
    secret: &[u8],
    tenant_key: &str,
    date: NaiveDate,
) -> Result<Zeroizing<[u8; KEY_LENGTH]>, CryptoError> {
    let info = key_info(tenant_key, date);
    let hk = Hkdf::<Sha256>::new(None, secret);

    let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
    hk.expand(info.as_bytes(), &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `payload` for `credential` under today's (UTC) key
pub fn encrypt_payload<T>(
    payload: &T,
    credential: &Credential,
) -> Result<EncryptionEnvelope, CryptoError>
where
    T: Serialize + ?Sized,
{
    encrypt_payload_on(payload, credential, Utc::now().date_naive())
}

/// Encrypt `payload` under the key for an explicit `date`, with a fresh random nonce
pub fn encrypt_payload_on<T>(
    payload: &T,
    credential: &Credential,
    date: NaiveDate,
) -> Result<EncryptionEnvelope, CryptoError>
where
    T: Serialize + ?Sized,
{
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce);
    seal(payload, credential, date, nonce)
}

/// Seal with a caller supplied nonce. Only fresh random nonces may reach the wire.
pub(crate) fn seal<T>(
    payload: &T,
    credential: &Credential,
    date: NaiveDate,
    nonce: [u8; NONCE_LENGTH],
) -> Result<EncryptionEnvelope, CryptoError>
where
    T: Serialize + ?Sized,
{
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);

    let secret = decode_secret(&credential.secret)?;
    let key = derive_daily_key(&secret, &credential.tenant_key, date)?;

    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    Ok(EncryptionEnvelope {
        encrypted: true,
        key_date: date,
        secret_version: SECRET_VERSION,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Standard base64 (padded) for byte fields on the wire
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
