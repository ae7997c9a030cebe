//! Key identity and ownership.
//!
//! This module owns two responsibilities:
//! 1. Naming a specific version of a system or intermediate key (`KeyMeta`).
//! 2. Holding unwrapped key material in a type that is opaque, non-cloneable
//!    and zeroised on drop (`CryptoKey`).
//!
//! Cached keys are shared as `Arc<CryptoKey>`. A handle obtained by an
//! in-flight encrypt or decrypt stays valid even if the cache evicts the
//! entry in the meantime; the bytes are scrubbed when the last handle drops.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::KeystrataError;

/// Identifies one version of a key: its id plus its creation second.
///
/// Two `KeyMeta` with equal id and `created` denote the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyMeta {
    #[serde(rename = "KeyId")]
    pub id: String,
    #[serde(rename = "Created")]
    pub created: i64,
}

impl KeyMeta {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
        }
    }
}

impl fmt::Display for KeyMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.created)
    }
}

/// Unwrapped SK or IK material.
///
/// - Not `Clone`. Shared through `Arc` only.
/// - Zeroised on drop.
/// - Raw bytes are `pub(crate)`; they never leave the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey {
    bytes: [u8; KEY_LEN],
    #[zeroize(skip)]
    meta: KeyMeta,
    #[zeroize(skip)]
    revoked: bool,
}

impl CryptoKey {
    /// Generate a fresh random key with the given identity.
    pub(crate) fn generate(meta: KeyMeta) -> Result<Self, KeystrataError> {
        let bytes = crypto::generate_random_key()?;
        Ok(Self {
            bytes: *bytes,
            meta,
            revoked: false,
        })
    }

    /// Build a key from unwrapped bytes. Rejects anything but 32 bytes.
    pub(crate) fn from_slice(
        meta: KeyMeta,
        revoked: bool,
        bytes: &[u8],
    ) -> Result<Self, KeystrataError> {
        let bytes = *crypto::key_array(bytes)?;
        Ok(Self {
            bytes,
            meta,
            revoked,
        })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn meta(&self) -> &KeyMeta {
        &self.meta
    }

    pub fn created(&self) -> i64 {
        self.meta.created
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    /// Whether this key has outlived `expire_after_secs` at `now` (Unix seconds).
    pub fn is_expired(&self, now: i64, expire_after_secs: i64) -> bool {
        is_key_expired(self.meta.created, now, expire_after_secs)
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("meta", &self.meta)
            .field("revoked", &self.revoked)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A key is expired once strictly more than `expire_after_secs` have passed
/// since its creation.
pub fn is_key_expired(created: i64, now: i64, expire_after_secs: i64) -> bool {
    now.saturating_sub(created) > expire_after_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_strictly_greater_than_ttl() {
        assert!(!is_key_expired(100, 160, 60));
        assert!(is_key_expired(100, 161, 60));
        assert!(!is_key_expired(100, 90, 60));
    }

    #[test]
    fn from_slice_rejects_short_material() {
        let meta = KeyMeta::new("_IK_p_svc_prod", 60);
        assert!(matches!(
            CryptoKey::from_slice(meta, false, &[1u8; 16]),
            Err(KeystrataError::InvalidKey)
        ));
    }

    #[test]
    fn debug_never_prints_bytes() {
        let key = CryptoKey::from_slice(KeyMeta::new("_SK_svc_prod", 0), false, &[0xAB; 32])
            .unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn generated_keys_differ() {
        let a = CryptoKey::generate(KeyMeta::new("_IK_a", 1)).unwrap();
        let b = CryptoKey::generate(KeyMeta::new("_IK_a", 1)).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert!(!a.is_revoked());
    }
}
