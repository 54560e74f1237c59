//! Post-quantum cryptography engine for KEMGate.
//!
//! Wraps the PQClean Kyber and Dilithium implementations behind a small,
//! stateless API: every operation takes its key material as an argument and
//! returns owned byte buffers. Algorithm selection is data, not a type
//! parameter, so the proxy can pick algorithms from configuration.
//!
//! The crate also owns the KMS envelope format: a JSON blob whose AES data
//! key is wrapped by a KMS key-encryption key and whose payloads are
//! AES-256-CBC ciphertexts with a leading 16-octet IV.

pub mod envelope;
pub mod error;
pub mod kem;
pub mod sig;

pub use envelope::{EnvelopeKey, KmsWrappedKey};
pub use error::{CryptoError, CryptoResult};
pub use kem::{KemAlgorithm, KemKeyPair};
pub use sig::{SigAlgorithm, SigKeyPair};
