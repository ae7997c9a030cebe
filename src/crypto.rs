//! Low-level cryptographic operations.
//!
//! This module is the only place in the crate that imports `ring::aead`.
//! Every layer of the hierarchy (payload under DRK, DRK under IK, IK under
//! SK, SK under the static master key) goes through the functions here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//!
//! # Layout of ciphertext bytes
//! ```text
//! [ ciphertext ][ GCM tag (16 bytes) ][ nonce (12 bytes) ]
//! ```
//! The nonce is appended rather than prepended. Every implementation of the
//! envelope format uses this layout, so it must not change.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::KeystrataError;

/// The AEAD algorithm used throughout keystrata.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of every key in the hierarchy in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Generate a cryptographically secure random nonce.
///
/// A fresh nonce is drawn for every encryption call. There is no nonce
/// caching and no counter, so a nonce is never reused under the same key
/// short of an RNG failure, which aborts the call.
fn generate_nonce() -> Result<[u8; NONCE_LEN], KeystrataError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; NONCE_LEN];
    rng.fill(&mut buf)
        .map_err(|_| KeystrataError::RandomnessFailure)?;
    Ok(buf)
}

fn bind_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, KeystrataError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| KeystrataError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes`, authenticating `aad` alongside it.
///
/// Returns `ciphertext || tag || nonce`.
pub fn encrypt(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, KeystrataError> {
    let key = bind_key(key_bytes)?;
    let nonce_bytes = generate_nonce()?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut output = Vec::with_capacity(plaintext.len() + TAG_LEN + NONCE_LEN);
    output.extend_from_slice(plaintext);
    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut output)
        .map_err(|_| KeystrataError::InvalidKey)?;
    output.extend_from_slice(&nonce_bytes);

    Ok(output)
}

/// Decrypt bytes produced by [`encrypt`].
///
/// A wrong key, wrong `aad`, truncated input or any tampering fails the GCM
/// tag check with `IntegrityCheckFailed`. The caller receives no partial
/// plaintext; the working buffer is scrubbed on failure.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, KeystrataError> {
    if ciphertext.len() < TAG_LEN + NONCE_LEN {
        return Err(KeystrataError::IntegrityCheckFailed);
    }

    let (sealed, nonce_bytes) = ciphertext.split_at(ciphertext.len() - NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| KeystrataError::IntegrityCheckFailed)?;
    let key = bind_key(key_bytes)?;

    let mut buffer = Zeroizing::new(sealed.to_vec());
    let plaintext_len = key
        .open_in_place(nonce, Aad::from(aad), buffer.as_mut_slice())
        .map_err(|_| KeystrataError::IntegrityCheckFailed)?
        .len();
    buffer.truncate(plaintext_len);

    Ok(std::mem::take(&mut *buffer))
}

/// Wrap a child key under its parent. Same AEAD, the child's raw bytes as
/// plaintext, no associated data.
pub fn wrap_key(parent: &[u8; KEY_LEN], child: &[u8]) -> Result<Vec<u8>, KeystrataError> {
    encrypt(parent, child, &[])
}

/// Unwrap a child key. The returned bytes are scrubbed when dropped.
pub fn unwrap_key(
    parent: &[u8; KEY_LEN],
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeystrataError> {
    decrypt(parent, wrapped, &[]).map(Zeroizing::new)
}

/// Generate a cryptographically secure random key.
///
/// This is the only function in the crate that produces raw key material
/// from scratch: every SK, IK and DRK starts here.
pub fn generate_random_key() -> Result<Zeroizing<[u8; KEY_LEN]>, KeystrataError> {
    let rng = SystemRandom::new();
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rng.fill(key.as_mut_slice())
        .map_err(|_| KeystrataError::RandomnessFailure)?;
    Ok(key)
}

/// View a key slice as a fixed-size key, rejecting any other length.
pub(crate) fn key_array(bytes: &[u8]) -> Result<&[u8; KEY_LEN], KeystrataError> {
    bytes.try_into().map_err(|_| KeystrataError::InvalidKey)
}
