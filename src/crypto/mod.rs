//! Client-side payload encryption.
//!
//! Backups are sealed before they leave the process, independently of whatever
//! server-side encryption the object store applies. The catalog only ever records the
//! key *reference*; [`KeyProvider`] turns a reference into key material at run time.

mod envelope;

pub use envelope::{Opener, Sealer, FLAG_GZIP, HEADER_LEN, MAX_FRAME_PLAINTEXT};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Key length for XChaCha20-Poly1305
pub const KEY_LEN: usize = 32;

/// Errors from key resolution and the sealing envelope
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key reference could not be resolved
    #[error("unknown encryption key reference {0}")]
    UnknownKey(String),

    /// Key material has the wrong shape
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Header magic or version not recognized
    #[error("not a backup envelope: {0}")]
    BadHeader(String),

    /// A frame failed authentication (wrong key or tampered data)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Stream ended before the final frame
    #[error("envelope truncated before final frame")]
    Truncated,

    /// Bytes after the final frame
    #[error("unexpected data after final frame")]
    TrailingData,

    /// Frame counter exhausted
    #[error("too many frames in one envelope")]
    FrameLimit,

    /// Compression codec failure
    #[error("compression error: {0}")]
    Compression(String),
}

/// 256-bit symmetric key
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not base64: {}", e)))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|raw: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, raw.len())))?;
        Ok(Self(bytes))
    }

    /// Fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Resolves an opaque key reference to key material
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Look up the key named by `key_ref`
    async fn resolve(&self, key_ref: &str) -> Result<EncryptionKey, CryptoError>;
}

/// Keys held in process memory
#[derive(Debug, Default, Clone)]
pub struct StaticKeyProvider {
    keys: HashMap<String, EncryptionKey>,
}

impl StaticKeyProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding one freshly generated key under `key_ref`
    pub fn generated(key_ref: impl Into<String>) -> Self {
        Self::new().with_key(key_ref, EncryptionKey::generate())
    }

    /// Register a key
    pub fn with_key(mut self, key_ref: impl Into<String>, key: EncryptionKey) -> Self {
        self.keys.insert(key_ref.into(), key);
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn resolve(&self, key_ref: &str) -> Result<EncryptionKey, CryptoError> {
        self.keys
            .get(key_ref)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownKey(key_ref.to_string()))
    }
}

/// Reads base64 keys from environment variables.
///
/// The reference `env:BACKUP_KEY` (or plain `BACKUP_KEY`) names the variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvKeyProvider;

#[async_trait]
impl KeyProvider for EnvKeyProvider {
    async fn resolve(&self, key_ref: &str) -> Result<EncryptionKey, CryptoError> {
        let variable = key_ref.strip_prefix("env:").unwrap_or(key_ref);
        let encoded = std::env::var(variable).map_err(|_| CryptoError::UnknownKey(key_ref.to_string()))?;
        EncryptionKey::from_base64(&encoded)
    }
}
