// src/handlers/health.rs - Aggregated health checks and metrics exposition
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Healthy,
            error: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Unhealthy,
            error: Some(error.into()),
        }
    }
}

/// A registered health probe. Checks run concurrently on every
/// `GET /healthz`.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> CheckResult;
}

/// Healthy as long as the accept loop is running.
pub struct ProxyCheck {
    accepting: Arc<AtomicBool>,
}

impl ProxyCheck {
    pub fn new(accepting: Arc<AtomicBool>) -> Self {
        Self { accepting }
    }
}

#[async_trait]
impl HealthCheck for ProxyCheck {
    async fn check(&self) -> CheckResult {
        if self.accepting.load(Ordering::SeqCst) {
            CheckResult::healthy("proxy")
        } else {
            CheckResult::unhealthy("proxy", "accept loop is not running")
        }
    }
}

/// TCP connect probe against a configured upstream.
pub struct BackendCheck {
    addr: String,
    timeout: Duration,
}

impl BackendCheck {
    pub fn new(addr: String, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn name(&self) -> String {
        format!("backend_{}", self.addr)
    }
}

#[async_trait]
impl HealthCheck for BackendCheck {
    async fn check(&self) -> CheckResult {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => CheckResult::healthy(self.name()),
            Ok(Err(e)) => CheckResult::unhealthy(self.name(), e.to_string()),
            Err(_) => CheckResult::unhealthy(
                self.name(),
                format!("connect timed out after {:?}", self.timeout),
            ),
        }
    }
}

/// Aggregated health endpoint: 200 when every check passes, 503 otherwise.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let results = futures_util::future::join_all(state.checks.iter().map(|c| c.check())).await;
    let all_healthy = results.iter().all(|r| r.status == CheckStatus::Healthy);

    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(json!({ "checks": results })))
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    if !state.config.monitoring.metrics_enabled {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(state.metrics.render())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the monitoring surface until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.monitoring.metrics_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "monitoring endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_check_follows_accept_flag() {
        let accepting = Arc::new(AtomicBool::new(true));
        let check = ProxyCheck::new(accepting.clone());

        let result = check.check().await;
        assert_eq!(result.status, CheckStatus::Healthy);

        accepting.store(false, Ordering::SeqCst);
        let result = check.check().await;
        assert_eq!(result.status, CheckStatus::Unhealthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_backend_check_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // keep the listener alive for the duration of the probe
        let check = BackendCheck::new(addr.to_string(), Duration::from_secs(1));
        let result = check.check().await;
        assert_eq!(result.status, CheckStatus::Healthy);
        drop(listener);
    }

    #[tokio::test]
    async fn test_backend_check_unreachable() {
        // bind-then-drop guarantees a closed port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let check = BackendCheck::new(addr.to_string(), Duration::from_secs(1));
        let result = check.check().await;
        assert_eq!(result.status, CheckStatus::Unhealthy);
    }

    #[test]
    fn test_check_result_wire_shape() {
        let healthy = serde_json::to_value(CheckResult::healthy("proxy")).unwrap();
        assert_eq!(healthy, json!({"name": "proxy", "status": "healthy"}));

        let unhealthy =
            serde_json::to_value(CheckResult::unhealthy("backend_x", "refused")).unwrap();
        assert_eq!(
            unhealthy,
            json!({"name": "backend_x", "status": "unhealthy", "error": "refused"})
        );
    }
}
