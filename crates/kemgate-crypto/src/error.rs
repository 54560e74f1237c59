//! Error handling for post-quantum cryptographic operations

use thiserror::Error;

/// Errors surfaced by KEM, signature, and envelope operations.
///
/// Every variant names the algorithm it failed under so callers can log a
/// useful line without threading extra context. There is no silent fallback
/// path: a failed post-quantum operation is an error, never a downgrade.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to generate a key pair
    #[error("{algorithm}: key generation failed: {reason}")]
    KeyGeneration {
        algorithm: &'static str,
        reason: String,
    },

    /// Key material has the wrong length for the selected algorithm
    #[error("{algorithm}: invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Key bytes could not be parsed by the underlying implementation
    #[error("{algorithm}: malformed key material: {reason}")]
    InvalidKey {
        algorithm: &'static str,
        reason: String,
    },

    /// Encapsulation against a peer public key failed
    #[error("{algorithm}: encapsulation failed: {reason}")]
    Encapsulation {
        algorithm: &'static str,
        reason: String,
    },

    /// Decapsulation of a ciphertext failed
    #[error("{algorithm}: decapsulation failed: {reason}")]
    Decapsulation {
        algorithm: &'static str,
        reason: String,
    },

    /// Detached signing failed
    #[error("{algorithm}: signing failed: {reason}")]
    Signing {
        algorithm: &'static str,
        reason: String,
    },

    /// Signature bytes could not be parsed
    #[error("{algorithm}: malformed signature: {reason}")]
    InvalidSignature {
        algorithm: &'static str,
        reason: String,
    },

    /// Envelope payload could not be decrypted
    #[error("envelope decryption failed: {reason}")]
    Envelope { reason: String },

    /// Envelope blob is not a valid wrapped-key document
    #[error("invalid envelope format: {reason}")]
    EnvelopeFormat { reason: String },
}

impl CryptoError {
    pub fn envelope(reason: impl Into<String>) -> Self {
        Self::Envelope {
            reason: reason.into(),
        }
    }

    pub fn envelope_format(reason: impl Into<String>) -> Self {
        Self::EnvelopeFormat {
            reason: reason.into(),
        }
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
