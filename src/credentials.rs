// src/credentials.rs - Certificate and key material loading
use chrono::{DateTime, TimeZone, Utc};
use kemgate_crypto::envelope::EnvelopeKey;
use kemgate_crypto::kem::KemKeyPair;
use kemgate_crypto::KmsWrappedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use x509_parser::prelude::*;

use crate::config::{QuantumSettings, TlsSettings};
use crate::error::{ProxyError, ProxyResult};
use crate::kms::KmsClient;

/// Where a PEM blob comes from. One `read` operation, no subclassing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    File(PathBuf),
    AwsSecret(String),
    Kms(String),
}

impl CredentialSource {
    /// Parse a source URI. A bare path is treated as `file://`.
    pub fn parse(uri: &str) -> ProxyResult<Self> {
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(name) = uri.strip_prefix("aws-secret://") {
            return Ok(Self::AwsSecret(name.to_string()));
        }
        if let Some(name) = uri.strip_prefix("kms://") {
            return Ok(Self::Kms(name.to_string()));
        }
        if uri.contains("://") {
            return Err(ProxyError::credential(format!(
                "unsupported credential source: {uri}"
            )));
        }
        Ok(Self::File(PathBuf::from(uri)))
    }

    /// Fetch the raw bytes behind this source.
    pub async fn read(&self, kms: Option<&dyn KmsClient>) -> ProxyResult<Vec<u8>> {
        match self {
            Self::File(path) => tokio::fs::read(path).await.map_err(|e| {
                ProxyError::credential(format!("cannot read {}: {e}", path.display()))
            }),
            Self::AwsSecret(name) => {
                let kms = kms.ok_or_else(|| {
                    ProxyError::credential(format!(
                        "aws-secret://{name} requires a configured KMS client"
                    ))
                })?;
                kms.get_secret(name).await
            }
            Self::Kms(name) => {
                let kms = kms.ok_or_else(|| {
                    ProxyError::credential(format!("kms://{name} requires a configured KMS client"))
                })?;
                kms.get_secret(name).await
            }
        }
    }
}

/// Immutable certificate material plus the leaf metadata the lifecycle
/// worker needs. Built once per load; consumed by the TLS context manager.
pub struct CertificateBundle {
    pub chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub ca: Option<Vec<CertificateDer<'static>>>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the leaf DER, hex-encoded.
    pub fingerprint: String,
}

impl CertificateBundle {
    /// Parse a bundle out of PEM blobs. The first certificate in
    /// `cert_pem` is the leaf.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> ProxyResult<Self> {
        let chain = parse_cert_chain(cert_pem)?;
        if chain.is_empty() {
            return Err(ProxyError::credential(
                "certificate file contains no certificates",
            ));
        }

        let mut key_slice = key_pem;
        let private_key = rustls_pemfile::private_key(&mut key_slice)
            .map_err(|e| ProxyError::credential(format!("cannot parse private key: {e}")))?
            .ok_or_else(|| ProxyError::credential("key file contains no private key"))?;

        let ca = match ca_pem {
            Some(pem) => {
                let certs = parse_cert_chain(pem)?;
                if certs.is_empty() {
                    return Err(ProxyError::credential("CA file contains no certificates"));
                }
                Some(certs)
            }
            None => None,
        };

        let leaf = &chain[0];
        let (not_before, not_after) = parse_validity(leaf.as_ref())?;
        let fingerprint = hex::encode(Sha256::digest(leaf.as_ref()));

        Ok(Self {
            chain,
            private_key,
            ca,
            not_before,
            not_after,
            fingerprint,
        })
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }
}

fn parse_cert_chain(pem: &[u8]) -> ProxyResult<Vec<CertificateDer<'static>>> {
    let mut slice = pem;
    rustls_pemfile::certs(&mut slice)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::credential(format!("cannot parse certificate PEM: {e}")))
}

fn parse_validity(leaf_der: &[u8]) -> ProxyResult<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, cert) = X509Certificate::from_der(leaf_der)
        .map_err(|e| ProxyError::credential(format!("cannot parse leaf certificate: {e}")))?;
    let validity = cert.validity();
    let not_before = Utc
        .timestamp_opt(validity.not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| ProxyError::credential("leaf not_before out of range"))?;
    let not_after = Utc
        .timestamp_opt(validity.not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| ProxyError::credential("leaf not_after out of range"))?;
    Ok((not_before, not_after))
}

/// Load the server certificate bundle named by the TLS settings. The
/// cert/key/CA paths accept `file://`, `aws-secret://`, and bare paths.
pub async fn load_bundle(
    tls: &TlsSettings,
    kms: Option<&dyn KmsClient>,
) -> ProxyResult<CertificateBundle> {
    let cert_source = CredentialSource::parse(&tls.cert_file.to_string_lossy())?;
    let key_source = CredentialSource::parse(&tls.key_file.to_string_lossy())?;

    let cert_pem = cert_source.read(kms).await?;
    let key_pem = key_source.read(kms).await?;

    let ca_pem = match &tls.ca_file {
        Some(path) => {
            let source = CredentialSource::parse(&path.to_string_lossy())?;
            Some(source.read(kms).await?)
        }
        None => None,
    };

    CertificateBundle::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
}

/// Load and unwrap the KEM key pair envelope from KMS.
///
/// Steps: fetch the envelope blob, KMS-decrypt the wrapped AES data key,
/// AES-CBC-open both key payloads, then size-validate against the
/// configured algorithm. Any failure aborts the whole load.
pub async fn load_kem_material(
    quantum: &QuantumSettings,
    kms: &dyn KmsClient,
) -> ProxyResult<KemKeyPair> {
    let key_name = quantum
        .key_name
        .as_ref()
        .ok_or_else(|| ProxyError::credential("quantum.key_name is not configured"))?;
    let aes_key_name = quantum
        .kms_aes_key_name
        .as_ref()
        .ok_or_else(|| ProxyError::credential("quantum.kms_aes_key_name is not configured"))?;

    let blob = kms.get_secret(key_name).await?;
    let envelope = KmsWrappedKey::from_json(&blob)?;

    let wrapped_aes_key = envelope.wrapped_aes_key()?;
    let aes_key_bytes = kms.decrypt(aes_key_name, &wrapped_aes_key).await?;
    let aes_key = EnvelopeKey::from_slice(&aes_key_bytes)?;

    let (public_key, private_key) = envelope.open(&aes_key)?;
    KemKeyPair::from_bytes(quantum.kem_algorithm, &public_key, &private_key).map_err(Into::into)
}
