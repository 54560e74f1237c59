// src/tls/lifecycle.rs - Certificate expiry watching and renewal
use async_trait::async_trait;
use chrono::Utc;
use kemgate_crypto::KemKeyPair;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{RenewalSettings, TlsSettings};
use crate::credentials;
use crate::error::{ProxyError, ProxyResult};
use crate::kms::KmsClient;
use crate::tls::context::TlsContextManager;

/// External renewal mechanism. The default shells out to certbot; tests
/// inject their own.
#[async_trait]
pub trait RenewalAction: Send + Sync {
    async fn renew(&self, domain: &str) -> ProxyResult<()>;
}

/// Renew via the certbot CLI, non-interactively.
pub struct CertbotRenewal;

#[async_trait]
impl RenewalAction for CertbotRenewal {
    async fn renew(&self, domain: &str) -> ProxyResult<()> {
        let output = tokio::process::Command::new("certbot")
            .args(["renew", "--non-interactive", "--quiet", "--cert-name", domain])
            .output()
            .await
            .map_err(|e| ProxyError::Renewal(format!("cannot spawn certbot: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProxyError::Renewal(format!(
                "certbot exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Bookkeeping for the certificate under management.
///
/// `in_flight_renewal` has a single writer (the worker task); it exists so
/// a tick that lands while a renewal is still running is a no-op instead
/// of a second renewal.
struct CertificateState {
    last_checked: SystemTime,
    renewal_threshold_days: i64,
    domain: Option<String>,
    in_flight_renewal: bool,
}

/// Long-lived task that keeps the published TLS context in sync with the
/// on-disk certificate: hot-reloads on file change, renews ahead of
/// expiry, and never replaces a working context with a broken one.
pub struct LifecycleWorker {
    tls: TlsSettings,
    renewal: RenewalSettings,
    manager: Arc<TlsContextManager>,
    kms: Option<Arc<dyn KmsClient>>,
    kem_material: Option<KemKeyPair>,
    renewer: Arc<dyn RenewalAction>,
    state: CertificateState,
    trigger: Arc<Notify>,
    last_renewal_check: Option<Instant>,
}

impl LifecycleWorker {
    pub fn new(
        tls: TlsSettings,
        renewal: RenewalSettings,
        manager: Arc<TlsContextManager>,
        kms: Option<Arc<dyn KmsClient>>,
        kem_material: Option<KemKeyPair>,
        renewer: Arc<dyn RenewalAction>,
    ) -> Self {
        let state = CertificateState {
            last_checked: SystemTime::now(),
            renewal_threshold_days: renewal.renewal_threshold_days,
            domain: renewal.domain.clone(),
            in_flight_renewal: false,
        };
        Self {
            tls,
            renewal,
            manager,
            kms,
            kem_material,
            renewer,
            state,
            trigger: Arc::new(Notify::new()),
            last_renewal_check: None,
        }
    }

    /// Handle for out-of-band ticks (`trigger_now` in operator tooling).
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.tls.check_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // consume the immediate first tick; startup already published a context
        ticker.tick().await;

        tracing::info!(
            check_interval = self.tls.check_interval,
            auto_renewal = self.renewal.enable_auto_renewal,
            "certificate lifecycle worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.trigger.notified() => {
                    tracing::info!("out-of-band certificate check triggered");
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("certificate lifecycle worker stopping");
                    break;
                }
            }
        }
    }

    async fn tick(&mut self) {
        // The previous check time is captured before being overwritten so
        // the mtime comparison below is against the last completed scan.
        let previous_check = self.state.last_checked;
        self.state.last_checked = SystemTime::now();

        if let Some(mtime) = self.cert_mtime() {
            if mtime > previous_check {
                tracing::info!("certificate file changed on disk, reloading TLS context");
                match self.reload_and_publish().await {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "certificate reload failed, keeping current context");
                    }
                }
            }
        }

        if self.renewal.enable_auto_renewal && self.renewal_due() {
            self.check_renewal().await;
        }
    }

    /// Renewal eligibility is checked on its own cadence, which may be
    /// slower than the mtime scan.
    fn renewal_due(&mut self) -> bool {
        let interval = Duration::from_secs(self.renewal.renewal_check_interval);
        match self.last_renewal_check {
            Some(last) if last.elapsed() < interval => false,
            _ => {
                self.last_renewal_check = Some(Instant::now());
                true
            }
        }
    }

    async fn check_renewal(&mut self) {
        let ctx = self.manager.snapshot();
        let days_left = (ctx.not_after - Utc::now()).num_days();
        if days_left > self.state.renewal_threshold_days {
            tracing::debug!(days_left, "certificate not due for renewal");
            return;
        }

        if self.state.in_flight_renewal {
            tracing::debug!("renewal already in flight, skipping");
            return;
        }

        let Some(domain) = self.state.domain.clone() else {
            tracing::error!("certificate due for renewal but no domain configured");
            return;
        };

        tracing::warn!(days_left, %domain, "certificate expiring, starting renewal");
        self.state.in_flight_renewal = true;
        let result = self.renewer.renew(&domain).await;
        self.state.in_flight_renewal = false;

        match result {
            Ok(()) => {
                tracing::info!(%domain, "certificate renewed, reloading TLS context");
                if let Err(e) = self.reload_and_publish().await {
                    tracing::error!(error = %e, "post-renewal reload failed, keeping current context");
                }
            }
            Err(e) => {
                // retried on the next eligible tick; the current context stays up
                tracing::error!(error = %e, %domain, "certificate renewal failed");
            }
        }
    }

    async fn reload_and_publish(&self) -> ProxyResult<()> {
        let kms = self.kms.as_deref();
        let bundle = credentials::load_bundle(&self.tls, kms).await?;
        let ctx = TlsContextManager::build(
            &bundle,
            self.tls.use_hybrid,
            self.kem_material.as_ref(),
        )?;
        self.manager.publish(ctx);
        Ok(())
    }

    fn cert_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.tls.cert_file)
            .and_then(|m| m.modified())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockRenewal {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockRenewal {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl RenewalAction for MockRenewal {
        async fn renew(&self, _domain: &str) -> ProxyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProxyError::Renewal("mock failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn write_self_signed(dir: &PathBuf) -> (PathBuf, PathBuf, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        let bundle = crate::credentials::CertificateBundle::from_pem(
            cert.serialize_pem().unwrap().as_bytes(),
            cert.serialize_private_key_pem().as_bytes(),
            None,
        )
        .unwrap();
        (cert_path, key_path, bundle.fingerprint)
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kemgate-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn worker_for(
        dir: &PathBuf,
        renewal: RenewalSettings,
        renewer: Arc<dyn RenewalAction>,
    ) -> (LifecycleWorker, Arc<TlsContextManager>) {
        let (cert_path, key_path, _) = write_self_signed(dir);
        let tls = TlsSettings {
            cert_file: cert_path,
            key_file: key_path,
            ..TlsSettings::default()
        };
        let bundle = credentials::load_bundle(&tls, None).await.unwrap();
        let manager = Arc::new(TlsContextManager::new(
            TlsContextManager::build(&bundle, false, None).unwrap(),
        ));
        let worker = LifecycleWorker::new(tls, renewal, manager.clone(), None, None, renewer);
        (worker, manager)
    }

    #[tokio::test]
    async fn test_renewal_triggered_at_threshold() {
        let dir = temp_dir();
        // threshold far beyond the cert lifetime, so it is always "due"
        let renewal = RenewalSettings {
            enable_auto_renewal: true,
            renewal_check_interval: 0,
            renewal_threshold_days: 40_000,
            domain: Some("proxy.example.org".to_string()),
        };
        let renewer = MockRenewal::new(false);
        let (mut worker, _manager) = worker_for(&dir, renewal, renewer.clone()).await;

        worker.tick().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert!(!worker.state.in_flight_renewal);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_context_and_retries() {
        let dir = temp_dir();
        let renewal = RenewalSettings {
            enable_auto_renewal: true,
            renewal_check_interval: 0,
            renewal_threshold_days: 40_000,
            domain: Some("proxy.example.org".to_string()),
        };
        let renewer = MockRenewal::new(true);
        let (mut worker, manager) = worker_for(&dir, renewal, renewer.clone()).await;
        let before = manager.snapshot().fingerprint.clone();

        worker.tick().await;
        worker.tick().await;

        // failed both times, retried, and the working context is untouched
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.snapshot().fingerprint, before);
    }

    #[tokio::test]
    async fn test_not_renewed_outside_threshold() {
        let dir = temp_dir();
        let renewal = RenewalSettings {
            enable_auto_renewal: true,
            renewal_check_interval: 0,
            renewal_threshold_days: 0,
            domain: Some("proxy.example.org".to_string()),
        };
        let renewer = MockRenewal::new(false);
        let (mut worker, _manager) = worker_for(&dir, renewal, renewer.clone()).await;

        worker.tick().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mtime_change_reloads_context() {
        let dir = temp_dir();
        let renewer = MockRenewal::new(false);
        let (mut worker, manager) =
            worker_for(&dir, RenewalSettings::default(), renewer).await;
        let before = manager.snapshot().fingerprint.clone();

        // rotate the on-disk pair, then make the previous check time
        // predate the new mtime
        let (_, _, new_fingerprint) = write_self_signed(&dir);
        worker.state.last_checked = SystemTime::UNIX_EPOCH;

        worker.tick().await;
        let after = manager.snapshot().fingerprint.clone();
        assert_ne!(after, before);
        assert_eq!(after, new_fingerprint);
    }

    #[tokio::test]
    async fn test_unparseable_cert_keeps_prior_context() {
        let dir = temp_dir();
        let renewer = MockRenewal::new(false);
        let (mut worker, manager) =
            worker_for(&dir, RenewalSettings::default(), renewer).await;
        let before = manager.snapshot().fingerprint.clone();

        std::fs::write(&worker.tls.cert_file, b"garbage, not a certificate").unwrap();
        worker.state.last_checked = SystemTime::UNIX_EPOCH;

        worker.tick().await;
        assert_eq!(manager.snapshot().fingerprint, before);
    }

    #[tokio::test]
    async fn test_unchanged_mtime_does_not_reload() {
        let dir = temp_dir();
        let renewer = MockRenewal::new(false);
        let (mut worker, manager) =
            worker_for(&dir, RenewalSettings::default(), renewer).await;
        let before = Arc::as_ptr(&manager.snapshot());

        worker.tick().await;
        // same files, mtime older than the previous check: no publish
        assert_eq!(Arc::as_ptr(&manager.snapshot()), before);
    }
}
