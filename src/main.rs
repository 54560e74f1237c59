// src/main.rs - KEMGate: quantum-safe TLS terminating proxy
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kemgate::config::AppConfig;
use kemgate::credentials;
use kemgate::error::ProxyError;
use kemgate::handlers::health::{self, BackendCheck, HealthCheck, ProxyCheck};
use kemgate::kms::{AwsKms, KmsClient};
use kemgate::middleware::{JwtValidator, RateLimiter};
use kemgate::monitoring::metrics;
use kemgate::proxy::Dispatcher;
use kemgate::state::AppState;
use kemgate::tls::{CertbotRenewal, LifecycleWorker, TlsContextManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    // Load configuration from file + environment
    let config = Arc::new(AppConfig::load().map_err(fatal)?);

    // Metrics recorder must exist before the first connection
    let metrics_handle = metrics::install()?;

    // KMS client, only when some credential actually needs it
    let kms: Option<Arc<dyn KmsClient>> = if needs_kms(&config) {
        tracing::info!("connecting KMS client");
        Some(Arc::new(AwsKms::connect().await))
    } else {
        None
    };

    // Credential load failures here are fatal: better to crash before the
    // listener binds than to serve with broken material
    let bundle = credentials::load_bundle(&config.tls, kms.as_deref())
        .await
        .map_err(fatal)?;
    tracing::info!(
        fingerprint = %bundle.fingerprint,
        not_after = %bundle.not_after,
        "certificate bundle loaded"
    );

    // KEM material is best-effort: hybrid mode degrades to classical with
    // a warning instead of refusing to serve
    let kem_material = if config.tls.use_hybrid {
        if config.kem_material_configured() {
            let kms_ref = kms.as_deref().expect("kms client exists when material is configured");
            match credentials::load_kem_material(&config.quantum, kms_ref).await {
                Ok(material) => Some(material),
                Err(e) => {
                    tracing::warn!(error = %e, "KEM material unavailable, hybrid degrades to classical");
                    None
                }
            }
        } else {
            tracing::warn!("tls.use_hybrid set but quantum.key_name/kms_aes_key_name are missing");
            None
        }
    } else {
        None
    };

    let initial_ctx =
        TlsContextManager::build(&bundle, config.tls.use_hybrid, kem_material.as_ref())
            .map_err(fatal)?;
    let contexts = Arc::new(TlsContextManager::new(initial_ctx));

    // Bind before spawning anything; a bind failure is a clean non-zero exit
    let addr: SocketAddr = format!("{}:{}", config.proxy.host, config.proxy.port)
        .parse()
        .map_err(|e| fatal(ProxyError::config(format!("invalid proxy.host/port: {e}"))))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| fatal(ProxyError::config(format!("cannot bind {addr}: {e}"))))?;

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limiter.rate_limit,
        config.rate_limiter.per_seconds,
    ));
    let auth = JwtValidator::from_settings(&config.auth)
        .map_err(fatal)?
        .map(Arc::new);
    if auth.is_some() {
        tracing::info!("bearer-token pre-filter enabled");
    }

    let dispatcher = Arc::new(
        Dispatcher::new(config.clone(), contexts.clone(), limiter, auth).map_err(fatal)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health + Prometheus surface on the monitoring port
    let checks: Vec<Arc<dyn HealthCheck>> = vec![
        Arc::new(ProxyCheck::new(dispatcher.accepting_flag())),
        Arc::new(BackendCheck::new(
            config.backend.upstream_addr(),
            Duration::from_secs(config.backend.connect_timeout_secs),
        )),
    ];
    let state = AppState::new(config.clone(), checks, metrics_handle);
    let monitoring_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(state, monitoring_shutdown).await {
            tracing::error!(error = %e, "monitoring endpoint failed");
        }
    });

    // Certificate lifecycle worker: mtime hot-reload + auto renewal
    let worker = LifecycleWorker::new(
        config.tls.clone(),
        config.renewal.clone(),
        contexts.clone(),
        kms.clone(),
        kem_material,
        Arc::new(CertbotRenewal),
    );
    let trigger = worker.trigger_handle();
    tokio::spawn(worker.run(shutdown_rx.clone()));
    spawn_reload_signal_handler(trigger);

    tracing::info!(%addr, hybrid = config.tls.use_hybrid, "KEMGate proxy listening");
    tracing::info!(
        "health endpoint at http://0.0.0.0:{}/healthz",
        config.monitoring.metrics_port
    );

    let dispatcher_task = tokio::spawn(dispatcher.run(listener, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    dispatcher_task.await??;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Whether any configured credential source goes through KMS.
fn needs_kms(config: &AppConfig) -> bool {
    let remote = |s: &str| s.starts_with("aws-secret://") || s.starts_with("kms://");
    config.kem_material_configured()
        || remote(&config.tls.cert_file.to_string_lossy())
        || remote(&config.tls.key_file.to_string_lossy())
        || config
            .tls
            .ca_file
            .as_ref()
            .is_some_and(|p| remote(&p.to_string_lossy()))
}

fn fatal(e: ProxyError) -> anyhow::Error {
    tracing::error!(error = %e, "fatal startup error");
    anyhow::Error::new(e)
}

/// SIGHUP forces an out-of-band certificate check.
fn spawn_reload_signal_handler(trigger: Arc<tokio::sync::Notify>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, triggering certificate check");
            trigger.notify_one();
        }
    });
    #[cfg(not(unix))]
    drop(trigger);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("SIGTERM received, shutting down gracefully...");
        },
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kemgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    Ok(())
}
