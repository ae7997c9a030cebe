//! Key management service seam.
//!
//! The KMS wraps and unwraps system keys. It is the root of trust: SK bytes
//! are only ever persisted in the form the KMS returned. Production backends
//! (cloud key-management providers) implement `KeyManagementService` outside
//! this crate; `StaticKms` covers tests and single-host deployments.

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::error::KeystrataError;

/// Wraps and unwraps system keys.
///
/// Implementations report transient failures as `DependencyTimeout` or
/// `Unavailable` so the hierarchy can retry them.
pub trait KeyManagementService: Send + Sync {
    /// Wrap raw SK bytes. The result is opaque to the rest of the crate.
    fn encrypt_key(&self, key: &[u8]) -> Result<Vec<u8>, KeystrataError>;

    /// Recover raw SK bytes from a blob produced by `encrypt_key`.
    fn decrypt_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeystrataError>;
}

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The static KMS secret.
///
/// - Not `Clone`.
/// - Zeroised on drop.
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeystrataError> {
        Ok(Self::from_bytes(*crypto::key_array(bytes)?))
    }

    /// Parse 64 hex characters.
    pub fn from_hex(text: &str) -> Result<Self, KeystrataError> {
        let bytes = Zeroizing::new(
            hex::decode(text.trim())
                .map_err(|_| KeystrataError::Config("master key is not valid hex".into()))?,
        );
        Self::from_slice(&bytes).map_err(|_| {
            KeystrataError::Config(format!("master key must be {KEY_LEN} bytes"))
        })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Generate a fresh random master key.
pub fn generate_master_key() -> Result<MasterKey, KeystrataError> {
    let bytes = crypto::generate_random_key()?;
    Ok(MasterKey::from_bytes(*bytes))
}

// ---------------------------------------------------------------------------
// Static KMS
// ---------------------------------------------------------------------------

/// A KMS backed by one fixed master key, wrapping with the crate's AEAD.
#[derive(Debug)]
pub struct StaticKms {
    master: MasterKey,
}

impl StaticKms {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }
}

impl KeyManagementService for StaticKms {
    fn encrypt_key(&self, key: &[u8]) -> Result<Vec<u8>, KeystrataError> {
        crypto::wrap_key(self.master.as_bytes(), key)
    }

    fn decrypt_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeystrataError> {
        crypto::unwrap_key(self.master.as_bytes(), blob)
    }
}
