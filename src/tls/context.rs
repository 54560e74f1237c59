// src/tls/context.rs - TLS server context construction and atomic rotation
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use kemgate_crypto::kem;
use kemgate_crypto::KemKeyPair;
use rustls::crypto::{ring, CryptoProvider};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;

use crate::config::BackendSettings;
use crate::credentials::CertificateBundle;
use crate::error::{ProxyError, ProxyResult};
use crate::tls::hybrid::X25519_KYBER768;

/// Immutable server-side TLS configuration plus the bundle metadata the
/// lifecycle worker keys its decisions on. Connections hold an
/// `Arc<TlsContext>` snapshot for their whole lifetime, so a context (and
/// the key material inside it) outlives every handshake started under it.
pub struct TlsContext {
    pub server_config: Arc<ServerConfig>,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
    /// Whether the compound KEM group is actually offered.
    pub hybrid: bool,
}

/// Single-writer, many-reader holder of the active context.
///
/// Readers snapshot once per accept; writers swap atomically. The previous
/// context is only dropped when the last connection that snapshotted it
/// goes away.
pub struct TlsContextManager {
    active: ArcSwap<TlsContext>,
}

impl TlsContextManager {
    pub fn new(initial: TlsContext) -> Self {
        Self {
            active: ArcSwap::from_pointee(initial),
        }
    }

    /// Build a server context from a certificate bundle.
    ///
    /// `hybrid` asks for the X25519+Kyber768 compound group. It is only
    /// honored when the supplied KEM material passes a round-trip check;
    /// otherwise a warning is emitted and the context is built with
    /// classical groups only, so the proxy keeps serving.
    pub fn build(
        bundle: &CertificateBundle,
        hybrid: bool,
        kem_material: Option<&KemKeyPair>,
    ) -> ProxyResult<TlsContext> {
        let hybrid_active = if hybrid {
            match validate_kem_material(kem_material) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(
                        reason = %reason,
                        "hybrid mode requested but KEM material unusable, \
                         falling back to classical key exchange"
                    );
                    false
                }
            }
        } else {
            false
        };

        let provider = Arc::new(if hybrid_active {
            hybrid_provider()
        } else {
            ring::default_provider()
        });

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| ProxyError::config(format!("cannot pin TLS 1.3: {e}")))?;

        let builder = match &bundle.ca {
            Some(ca_certs) => {
                let mut roots = RootCertStore::empty();
                for cert in ca_certs {
                    roots.add(cert.clone()).map_err(|e| {
                        ProxyError::credential(format!("invalid CA certificate: {e}"))
                    })?;
                }
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .allow_unauthenticated()
                        .build()
                        .map_err(|e| {
                            ProxyError::credential(format!("cannot build client verifier: {e}"))
                        })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let server_config = builder
            .with_single_cert(bundle.chain.clone(), bundle.private_key.clone_key())
            .map_err(|e| {
                ProxyError::credential(format!("certificate/key pair rejected: {e}"))
            })?;

        Ok(TlsContext {
            server_config: Arc::new(server_config),
            fingerprint: bundle.fingerprint.clone(),
            not_after: bundle.not_after,
            hybrid: hybrid_active,
        })
    }

    /// Atomically replace the active context. Never called with a broken
    /// context: `build` failures are handled by the caller, which keeps
    /// the previous one.
    pub fn publish(&self, ctx: TlsContext) {
        tracing::info!(
            fingerprint = %ctx.fingerprint,
            not_after = %ctx.not_after,
            hybrid = ctx.hybrid,
            "publishing TLS context"
        );
        self.active.store(Arc::new(ctx));
    }

    /// Cheap read, taken once per accepted connection.
    pub fn snapshot(&self) -> Arc<TlsContext> {
        self.active.load_full()
    }
}

fn hybrid_provider() -> CryptoProvider {
    let mut provider = ring::default_provider();
    provider.kx_groups.insert(0, X25519_KYBER768);
    provider
}

/// A usable KEM pair must be present and survive an encapsulate/decapsulate
/// round trip against itself.
fn validate_kem_material(material: Option<&KemKeyPair>) -> Result<(), String> {
    let material = material.ok_or_else(|| "no KEM material loaded".to_string())?;
    let (ciphertext, sender_secret) =
        kem::encapsulate(material.algorithm, material.public_key_bytes())
            .map_err(|e| e.to_string())?;
    let receiver_secret =
        kem::decapsulate(material.algorithm, &ciphertext, material.secret_key_bytes())
            .map_err(|e| e.to_string())?;
    if sender_secret == receiver_secret {
        Ok(())
    } else {
        Err("KEM material failed round-trip check".to_string())
    }
}

/// Client configuration for dialing the upstream over TLS, verifying it
/// against the configured private root.
pub fn build_upstream_client(backend: &BackendSettings) -> ProxyResult<Arc<ClientConfig>> {
    let ca_path = backend.ca_file.as_ref().ok_or_else(|| {
        ProxyError::config("backend.use_tls requires backend.ca_file")
    })?;
    let ca_pem = std::fs::read(ca_path).map_err(|e| {
        ProxyError::credential(format!("cannot read {}: {e}", ca_path.display()))
    })?;

    let mut roots = RootCertStore::empty();
    let mut slice = ca_pem.as_slice();
    for cert in rustls_pemfile::certs(&mut slice) {
        let cert = cert.map_err(|e| {
            ProxyError::credential(format!("cannot parse upstream CA: {e}"))
        })?;
        roots
            .add(cert)
            .map_err(|e| ProxyError::credential(format!("invalid upstream CA: {e}")))?;
    }
    if roots.is_empty() {
        return Err(ProxyError::credential("upstream CA file contains no certificates"));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProxyError::config(format!("cannot pin TLS 1.3: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
