//! KMS envelope format for wrapped key material.
//!
//! The envelope is a JSON document holding three opaque octet strings
//! (base64 in the JSON encoding):
//!
//! * `encrypted_aes_key` — the AES-256 data key, wrapped by a KMS
//!   key-encryption key; only KMS can unwrap it.
//! * `encrypted_public_key` / `encrypted_private_key` — PEM bundles
//!   encrypted with AES-256-CBC. The first 16 octets of each blob are the
//!   IV, the remainder is PKCS#7-padded ciphertext.
//!
//! Opening an envelope either yields both PEM payloads or fails; there is
//! no partially populated result.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_SIZE: usize = 16;

/// AES-256 data key recovered from KMS, zeroed on drop.
#[derive(ZeroizeOnDrop)]
pub struct EnvelopeKey {
    key: [u8; 32],
}

impl EnvelopeKey {
    pub fn from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != 32 {
            return Err(CryptoError::InvalidKeySize {
                algorithm: "AES-256-CBC",
                expected: 32,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(slice);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Wire form of a KMS-wrapped key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsWrappedKey {
    pub encrypted_aes_key: String,
    pub encrypted_public_key: String,
    pub encrypted_private_key: String,
}

impl KmsWrappedKey {
    /// Parse an envelope blob as returned by the secret store.
    pub fn from_json(blob: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(blob)
            .map_err(|e| CryptoError::envelope_format(format!("not a wrapped-key document: {e}")))
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }

    /// The wrapped AES data key, ready to hand to KMS `decrypt`.
    pub fn wrapped_aes_key(&self) -> CryptoResult<Vec<u8>> {
        BASE64
            .decode(&self.encrypted_aes_key)
            .map_err(|e| CryptoError::envelope_format(format!("encrypted_aes_key: {e}")))
    }

    /// Decrypt both PEM payloads with the unwrapped data key.
    ///
    /// Returns `(public_pem, private_pem)`.
    pub fn open(&self, key: &EnvelopeKey) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
        let public_blob = BASE64
            .decode(&self.encrypted_public_key)
            .map_err(|e| CryptoError::envelope_format(format!("encrypted_public_key: {e}")))?;
        let private_blob = BASE64
            .decode(&self.encrypted_private_key)
            .map_err(|e| CryptoError::envelope_format(format!("encrypted_private_key: {e}")))?;

        let public_pem = aes_cbc_decrypt(key.as_bytes(), &public_blob)?;
        let private_pem = aes_cbc_decrypt(key.as_bytes(), &private_blob)?;
        Ok((public_pem, private_pem))
    }

    /// Build an envelope from plaintext payloads. The caller supplies the
    /// already-wrapped AES key (the KMS ciphertext); this function never
    /// sees KMS. Used by provisioning tooling and tests.
    pub fn seal(
        key: &EnvelopeKey,
        wrapped_aes_key: &[u8],
        public_pem: &[u8],
        private_pem: &[u8],
    ) -> Self {
        Self {
            encrypted_aes_key: BASE64.encode(wrapped_aes_key),
            encrypted_public_key: BASE64.encode(aes_cbc_encrypt(key.as_bytes(), public_pem)),
            encrypted_private_key: BASE64.encode(aes_cbc_encrypt(key.as_bytes(), private_pem)),
        }
    }
}

/// Decrypt an `IV || ciphertext` blob with AES-256-CBC.
pub fn aes_cbc_decrypt(key: &[u8; 32], blob: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < IV_SIZE {
        return Err(CryptoError::envelope(format!(
            "blob too short for IV: {} bytes",
            blob.len()
        )));
    }
    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::envelope(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::envelope(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::envelope("bad padding"))
}

/// Encrypt a payload with AES-256-CBC, prefixing a random 16-octet IV.
pub fn aes_cbc_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    thread_rng().fill(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .expect("key and IV lengths are fixed");
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Mask a data key with a KEM shared secret (byte-wise XOR).
///
/// The same operation wraps and unwraps. The secret must be at least as
/// long as the data key so no byte is left unmasked.
pub fn xor_with_secret(data_key: &[u8], shared_secret: &[u8]) -> CryptoResult<Vec<u8>> {
    if shared_secret.len() < data_key.len() {
        return Err(CryptoError::envelope(format!(
            "shared secret ({} bytes) shorter than data key ({} bytes)",
            shared_secret.len(),
            data_key.len()
        )));
    }
    Ok(data_key
        .iter()
        .zip(shared_secret.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}
