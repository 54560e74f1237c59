//! Kyber key encapsulation.
//!
//! Thin byte-level wrapper over the PQClean Kyber variants. All key material
//! crosses this boundary as byte slices; sizes are validated before handing
//! anything to the underlying implementation.

use pqcrypto_kyber::{kyber1024, kyber512, kyber768};
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Supported KEM algorithms. `Kyber768` is the default everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KemAlgorithm {
    #[serde(rename = "kyber512", alias = "Kyber512")]
    Kyber512,
    #[serde(rename = "kyber768", alias = "Kyber768")]
    Kyber768,
    #[serde(rename = "kyber1024", alias = "Kyber1024")]
    Kyber1024,
}

impl Default for KemAlgorithm {
    fn default() -> Self {
        Self::Kyber768
    }
}

impl KemAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kyber512 => "Kyber512",
            Self::Kyber768 => "Kyber768",
            Self::Kyber1024 => "Kyber1024",
        }
    }

    pub fn public_key_size(&self) -> usize {
        match self {
            Self::Kyber512 => 800,
            Self::Kyber768 => 1184,
            Self::Kyber1024 => 1568,
        }
    }

    pub fn secret_key_size(&self) -> usize {
        match self {
            Self::Kyber512 => 1632,
            Self::Kyber768 => 2400,
            Self::Kyber1024 => 3168,
        }
    }

    pub fn ciphertext_size(&self) -> usize {
        match self {
            Self::Kyber512 => 768,
            Self::Kyber768 => 1088,
            Self::Kyber1024 => 1568,
        }
    }

    /// Shared secret size is 32 bytes for every Kyber variant.
    pub fn shared_secret_size(&self) -> usize {
        32
    }
}

/// A Kyber key pair. The secret half is zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KemKeyPair {
    #[zeroize(skip)]
    pub algorithm: KemAlgorithm,
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl KemKeyPair {
    pub fn from_bytes(
        algorithm: KemAlgorithm,
        public_key: &[u8],
        secret_key: &[u8],
    ) -> CryptoResult<Self> {
        if public_key.len() != algorithm.public_key_size() {
            return Err(CryptoError::InvalidKeySize {
                algorithm: algorithm.name(),
                expected: algorithm.public_key_size(),
                actual: public_key.len(),
            });
        }
        if secret_key.len() != algorithm.secret_key_size() {
            return Err(CryptoError::InvalidKeySize {
                algorithm: algorithm.name(),
                expected: algorithm.secret_key_size(),
                actual: secret_key.len(),
            });
        }
        Ok(Self {
            algorithm,
            public_key: public_key.to_vec(),
            secret_key: secret_key.to_vec(),
        })
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key_bytes(&self) -> &[u8] {
        &self.secret_key
    }
}

/// Generate a fresh key pair for the given algorithm.
pub fn generate_keypair(algorithm: KemAlgorithm) -> CryptoResult<KemKeyPair> {
    let (public_key, secret_key) = match algorithm {
        KemAlgorithm::Kyber512 => {
            let (pk, sk) = kyber512::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        KemAlgorithm::Kyber768 => {
            let (pk, sk) = kyber768::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        KemAlgorithm::Kyber1024 => {
            let (pk, sk) = kyber1024::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
    };
    Ok(KemKeyPair {
        algorithm,
        public_key,
        secret_key,
    })
}

/// Encapsulate against a peer public key.
///
/// Returns `(ciphertext, shared_secret)`.
pub fn encapsulate(
    algorithm: KemAlgorithm,
    peer_public: &[u8],
) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    if peer_public.len() != algorithm.public_key_size() {
        return Err(CryptoError::InvalidKeySize {
            algorithm: algorithm.name(),
            expected: algorithm.public_key_size(),
            actual: peer_public.len(),
        });
    }
    match algorithm {
        KemAlgorithm::Kyber512 => {
            let pk = kyber512::PublicKey::from_bytes(peer_public).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let (ss, ct) = kyber512::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), ss.as_bytes().to_vec()))
        }
        KemAlgorithm::Kyber768 => {
            let pk = kyber768::PublicKey::from_bytes(peer_public).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let (ss, ct) = kyber768::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), ss.as_bytes().to_vec()))
        }
        KemAlgorithm::Kyber1024 => {
            let pk = kyber1024::PublicKey::from_bytes(peer_public).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let (ss, ct) = kyber1024::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), ss.as_bytes().to_vec()))
        }
    }
}

/// Recover the shared secret from a ciphertext with our secret key.
pub fn decapsulate(
    algorithm: KemAlgorithm,
    ciphertext: &[u8],
    secret_key: &[u8],
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() != algorithm.ciphertext_size() {
        return Err(CryptoError::Decapsulation {
            algorithm: algorithm.name(),
            reason: format!(
                "invalid ciphertext size: expected {}, got {}",
                algorithm.ciphertext_size(),
                ciphertext.len()
            ),
        });
    }
    if secret_key.len() != algorithm.secret_key_size() {
        return Err(CryptoError::InvalidKeySize {
            algorithm: algorithm.name(),
            expected: algorithm.secret_key_size(),
            actual: secret_key.len(),
        });
    }
    match algorithm {
        KemAlgorithm::Kyber512 => {
            let sk = kyber512::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let ct = kyber512::Ciphertext::from_bytes(ciphertext).map_err(|e| {
                CryptoError::Decapsulation {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(kyber512::decapsulate(&ct, &sk).as_bytes().to_vec())
        }
        KemAlgorithm::Kyber768 => {
            let sk = kyber768::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let ct = kyber768::Ciphertext::from_bytes(ciphertext).map_err(|e| {
                CryptoError::Decapsulation {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(kyber768::decapsulate(&ct, &sk).as_bytes().to_vec())
        }
        KemAlgorithm::Kyber1024 => {
            let sk = kyber1024::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let ct = kyber1024::Ciphertext::from_bytes(ciphertext).map_err(|e| {
                CryptoError::Decapsulation {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(kyber1024::decapsulate(&ct, &sk).as_bytes().to_vec())
        }
    }
}

/// Full round-trip self test: generate, encapsulate, decapsulate, compare.
///
/// Used at startup to validate externally sourced key material handling and
/// by the TLS layer before advertising the hybrid group.
pub fn verify_round_trip(algorithm: KemAlgorithm) -> CryptoResult<()> {
    let keypair = generate_keypair(algorithm)?;
    let (ciphertext, sender_secret) = encapsulate(algorithm, keypair.public_key_bytes())?;
    let receiver_secret = decapsulate(algorithm, &ciphertext, keypair.secret_key_bytes())?;
    if sender_secret == receiver_secret {
        Ok(())
    } else {
        Err(CryptoError::Decapsulation {
            algorithm: algorithm.name(),
            reason: "shared secrets diverged".into(),
        })
    }
}
