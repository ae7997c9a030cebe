//! Error types for keystrata.
//!
//! Every variant is a distinct failure mode of the key hierarchy or the
//! envelope. Messages are intentionally minimal: they signal *what* failed
//! without echoing key material or plaintext.

use thiserror::Error;

/// The single error type for all keystrata operations.
#[derive(Debug, Error)]
pub enum KeystrataError {
    /// The metastore has no record for a required key.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A metastore or KMS call exceeded its deadline. Safe to retry.
    #[error("dependency timed out: {0}")]
    DependencyTimeout(String),

    /// A metastore or KMS backend reported a transient failure. Safe to retry.
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// AEAD authentication failed: wrong key, tampered or truncated ciphertext.
    /// No partial plaintext is ever returned alongside this error.
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// The serialized envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Encrypt or decrypt was called on a closed session.
    #[error("session is closed")]
    SessionClosed,

    /// `setup` was called while the runtime is already initialized.
    #[error("already initialized; call shutdown first")]
    AlreadyInitialized,

    /// A runtime operation was called before `setup`.
    #[error("not initialized; call setup first")]
    NotInitialized,

    /// A revoked key was about to be used for encryption.
    #[error("key revoked: {0}")]
    KeyRevoked(String),

    /// Key material had the wrong length or could not be loaded into the cipher.
    #[error("invalid key")]
    InvalidKey,

    /// The system random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// A non-transient metastore failure.
    #[error("metastore error: {0}")]
    Metastore(String),

    /// A non-transient KMS failure.
    #[error("kms error: {0}")]
    Kms(String),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Decrypted bytes were requested as a string but are not UTF-8.
    #[error("plaintext is not valid utf-8")]
    InvalidUtf8,
}

impl KeystrataError {
    /// Whether the key hierarchy may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DependencyTimeout(_) | Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for KeystrataError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::DependencyTimeout(err.to_string())
            }
            _ => Self::Metastore(err.to_string()),
        }
    }
}
