//! Error types for onion construction, peeling, transport and configuration.
//!
//! Nothing here is fatal to a running relay: the state machine turns every
//! error into a dropped onion.

use thiserror::Error;

/// Failures of the primitive cipher and key agreement adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext cannot even hold an IV and authentication tag.
    #[error("ciphertext too short: {len} bytes (minimum {min})")]
    CiphertextTooShort { len: usize, min: usize },

    #[error("encryption failed")]
    Encryption,

    /// Wrong key or tampered ciphertext.
    #[error("decryption failed: invalid ciphertext or key")]
    Decryption,

    /// The peer's public key produced a non-contributory shared secret.
    #[error("key agreement failed")]
    KeyAgreement,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid base64: {0}")]
    Base64(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Failures of the header, content and sepal codecs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OnionError {
    #[error("decryption error: {0}")]
    Decryption(#[from] CryptoError),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Wire bytes that are not base64 encoded JSON of an onion.
    #[error("malformed onion: {0}")]
    MalformedOnion(String),

    #[error("content tag mismatch at layer {layer}")]
    TagMismatch { layer: usize },

    #[error("message too long: {len} bytes (max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("bruise tolerance {d} outside 0..={l1}")]
    InvalidBruiseTolerance { d: usize, l1: usize },

    #[error("expected {expected} {what}, got {actual}")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The sepal did not reveal a master key to the recipient.
    #[error("master key unavailable")]
    MasterKeyUnavailable,
}

pub type OnionResult<T> = Result<T, OnionError>;

impl OnionError {
    /// Cryptographic failures, as opposed to structural ones.
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            OnionError::Decryption(_) | OnionError::TagMismatch { .. } | OnionError::MasterKeyUnavailable
        )
    }
}

/// Failures reported by a transport while forwarding an envelope.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("peer answered with status {0}")]
    Status(u16),

    #[error("channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
