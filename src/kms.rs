// src/kms.rs - Key-management service client
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;

use crate::error::{ProxyError, ProxyResult};

/// The two operations the proxy needs from a KMS: unwrap a ciphertext under
/// a named key, and fetch a pre-stored secret blob by name.
///
/// `get_secret` exists so envelope retrieval is an explicit read instead of
/// a decrypt call with an empty ciphertext.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Decrypt `ciphertext` under the named key-encryption key.
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> ProxyResult<Vec<u8>>;

    /// Fetch an opaque secret blob (e.g. a wrapped-key envelope) by name.
    async fn get_secret(&self, name: &str) -> ProxyResult<Vec<u8>>;
}

/// AWS-backed implementation: KMS for `decrypt`, Secrets Manager for
/// `get_secret`. Credentials and region come from the ambient environment
/// (IAM role, profile, or env vars).
pub struct AwsKms {
    kms: aws_sdk_kms::Client,
    secrets: aws_sdk_secretsmanager::Client,
}

impl AwsKms {
    pub async fn connect() -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            kms: aws_sdk_kms::Client::new(&sdk_config),
            secrets: aws_sdk_secretsmanager::Client::new(&sdk_config),
        }
    }
}

#[async_trait]
impl KmsClient for AwsKms {
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> ProxyResult<Vec<u8>> {
        let response = self
            .kms
            .decrypt()
            .key_id(key_name)
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| {
                ProxyError::credential(format!("KMS decrypt failed for {key_name}: {e}"))
            })?;

        let plaintext = response.plaintext().ok_or_else(|| {
            ProxyError::credential(format!("KMS decrypt response for {key_name} has no plaintext"))
        })?;
        Ok(plaintext.as_ref().to_vec())
    }

    async fn get_secret(&self, name: &str) -> ProxyResult<Vec<u8>> {
        let response = self
            .secrets
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| ProxyError::credential(format!("secret fetch failed for {name}: {e}")))?;

        if let Some(binary) = response.secret_binary() {
            return Ok(binary.as_ref().to_vec());
        }
        if let Some(text) = response.secret_string() {
            return Ok(text.as_bytes().to_vec());
        }
        Err(ProxyError::credential(format!(
            "secret {name} has neither binary nor string payload"
        )))
    }
}

/// In-memory KMS used by tests and local development. `decrypt` only
/// succeeds for ciphertexts that were explicitly registered, mirroring the
/// fail-closed behavior of the real service.
#[derive(Default)]
pub struct MemoryKms {
    secrets: std::collections::HashMap<String, Vec<u8>>,
    wrapped: std::collections::HashMap<(String, Vec<u8>), Vec<u8>>,
}

impl MemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_secret(&mut self, name: impl Into<String>, blob: Vec<u8>) {
        self.secrets.insert(name.into(), blob);
    }

    pub fn register_wrapped_key(
        &mut self,
        key_name: impl Into<String>,
        ciphertext: Vec<u8>,
        plaintext: Vec<u8>,
    ) {
        self.wrapped.insert((key_name.into(), ciphertext), plaintext);
    }
}

#[async_trait]
impl KmsClient for MemoryKms {
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> ProxyResult<Vec<u8>> {
        self.wrapped
            .get(&(key_name.to_string(), ciphertext.to_vec()))
            .cloned()
            .ok_or_else(|| {
                ProxyError::credential(format!("KMS decrypt failed for {key_name}: unknown ciphertext"))
            })
    }

    async fn get_secret(&self, name: &str) -> ProxyResult<Vec<u8>> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::credential(format!("secret {name} not found")))
    }
}
