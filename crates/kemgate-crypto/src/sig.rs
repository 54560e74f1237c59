//! Dilithium detached signatures.

use pqcrypto_dilithium::{dilithium2, dilithium3, dilithium5};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Supported signature algorithms. `Dilithium3` is the default everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigAlgorithm {
    #[serde(rename = "dilithium2", alias = "Dilithium2")]
    Dilithium2,
    #[serde(rename = "dilithium3", alias = "Dilithium3")]
    Dilithium3,
    #[serde(rename = "dilithium5", alias = "Dilithium5")]
    Dilithium5,
}

impl Default for SigAlgorithm {
    fn default() -> Self {
        Self::Dilithium3
    }
}

impl SigAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dilithium2 => "Dilithium2",
            Self::Dilithium3 => "Dilithium3",
            Self::Dilithium5 => "Dilithium5",
        }
    }

    pub fn public_key_size(&self) -> usize {
        match self {
            Self::Dilithium2 => 1312,
            Self::Dilithium3 => 1952,
            Self::Dilithium5 => 2592,
        }
    }

    pub fn secret_key_size(&self) -> usize {
        match self {
            Self::Dilithium2 => 2528,
            Self::Dilithium3 => 4000,
            Self::Dilithium5 => 4864,
        }
    }

    pub fn signature_size(&self) -> usize {
        match self {
            Self::Dilithium2 => 2420,
            Self::Dilithium3 => 3293,
            Self::Dilithium5 => 4595,
        }
    }
}

/// A Dilithium key pair. The secret half is zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigKeyPair {
    #[zeroize(skip)]
    pub algorithm: SigAlgorithm,
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl SigKeyPair {
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key_bytes(&self) -> &[u8] {
        &self.secret_key
    }
}

/// Generate a fresh signing key pair.
pub fn generate_keypair(algorithm: SigAlgorithm) -> CryptoResult<SigKeyPair> {
    let (public_key, secret_key) = match algorithm {
        SigAlgorithm::Dilithium2 => {
            let (pk, sk) = dilithium2::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        SigAlgorithm::Dilithium3 => {
            let (pk, sk) = dilithium3::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
        SigAlgorithm::Dilithium5 => {
            let (pk, sk) = dilithium5::keypair();
            (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
        }
    };
    Ok(SigKeyPair {
        algorithm,
        public_key,
        secret_key,
    })
}

/// Produce a detached signature over `message`.
pub fn sign(algorithm: SigAlgorithm, message: &[u8], secret_key: &[u8]) -> CryptoResult<Vec<u8>> {
    if secret_key.len() != algorithm.secret_key_size() {
        return Err(CryptoError::InvalidKeySize {
            algorithm: algorithm.name(),
            expected: algorithm.secret_key_size(),
            actual: secret_key.len(),
        });
    }
    match algorithm {
        SigAlgorithm::Dilithium2 => {
            let sk = dilithium2::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium2::detached_sign(message, &sk).as_bytes().to_vec())
        }
        SigAlgorithm::Dilithium3 => {
            let sk = dilithium3::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium3::detached_sign(message, &sk).as_bytes().to_vec())
        }
        SigAlgorithm::Dilithium5 => {
            let sk = dilithium5::SecretKey::from_bytes(secret_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium5::detached_sign(message, &sk).as_bytes().to_vec())
        }
    }
}

/// Verify a detached signature.
///
/// Returns `Ok(false)` when the signature is well-formed but does not match;
/// malformed keys or signatures are errors.
pub fn verify(
    algorithm: SigAlgorithm,
    message: &[u8],
    signature: &[u8],
    public_key: &[u8],
) -> CryptoResult<bool> {
    if public_key.len() != algorithm.public_key_size() {
        return Err(CryptoError::InvalidKeySize {
            algorithm: algorithm.name(),
            expected: algorithm.public_key_size(),
            actual: public_key.len(),
        });
    }
    match algorithm {
        SigAlgorithm::Dilithium2 => {
            let pk = dilithium2::PublicKey::from_bytes(public_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let sig = dilithium2::DetachedSignature::from_bytes(signature).map_err(|e| {
                CryptoError::InvalidSignature {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium2::verify_detached_signature(&sig, message, &pk).is_ok())
        }
        SigAlgorithm::Dilithium3 => {
            let pk = dilithium3::PublicKey::from_bytes(public_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let sig = dilithium3::DetachedSignature::from_bytes(signature).map_err(|e| {
                CryptoError::InvalidSignature {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium3::verify_detached_signature(&sig, message, &pk).is_ok())
        }
        SigAlgorithm::Dilithium5 => {
            let pk = dilithium5::PublicKey::from_bytes(public_key).map_err(|e| {
                CryptoError::InvalidKey {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            let sig = dilithium5::DetachedSignature::from_bytes(signature).map_err(|e| {
                CryptoError::InvalidSignature {
                    algorithm: algorithm.name(),
                    reason: e.to_string(),
                }
            })?;
            Ok(dilithium5::verify_detached_signature(&sig, message, &pk).is_ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = generate_keypair(SigAlgorithm::Dilithium3).unwrap();
        let message = b"certificate rotation notice";
        let signature =
            sign(SigAlgorithm::Dilithium3, message, keypair.secret_key_bytes()).unwrap();
        assert_eq!(signature.len(), SigAlgorithm::Dilithium3.signature_size());

        let valid = verify(
            SigAlgorithm::Dilithium3,
            message,
            &signature,
            keypair.public_key_bytes(),
        )
        .unwrap();
        assert!(valid);
    }

    #[test]
    fn test_verify_rejects_modified_message() {
        let keypair = generate_keypair(SigAlgorithm::Dilithium3).unwrap();
        let signature =
            sign(SigAlgorithm::Dilithium3, b"original", keypair.secret_key_bytes()).unwrap();
        let valid = verify(
            SigAlgorithm::Dilithium3,
            b"tampered",
            &signature,
            keypair.public_key_bytes(),
        )
        .unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = generate_keypair(SigAlgorithm::Dilithium3).unwrap();
        let other = generate_keypair(SigAlgorithm::Dilithium3).unwrap();
        let signature =
            sign(SigAlgorithm::Dilithium3, b"message", signer.secret_key_bytes()).unwrap();
        let valid = verify(
            SigAlgorithm::Dilithium3,
            b"message",
            &signature,
            other.public_key_bytes(),
        )
        .unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_sign_rejects_bad_key_size() {
        let result = sign(SigAlgorithm::Dilithium3, b"message", &[0u8; 64]);
        assert!(matches!(result, Err(CryptoError::InvalidKeySize { .. })));
    }

    #[test]
    fn test_all_variants_round_trip() {
        for algorithm in [
            SigAlgorithm::Dilithium2,
            SigAlgorithm::Dilithium3,
            SigAlgorithm::Dilithium5,
        ] {
            let keypair = generate_keypair(algorithm).unwrap();
            let signature = sign(algorithm, b"probe", keypair.secret_key_bytes()).unwrap();
            assert!(verify(algorithm, b"probe", &signature, keypair.public_key_bytes()).unwrap());
        }
    }
}
