// src/state.rs - Shared state for the health/metrics surface
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::handlers::health::HealthCheck;

/// State behind the axum health/metrics router.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub checks: Arc<Vec<Arc<dyn HealthCheck>>>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        checks: Vec<Arc<dyn HealthCheck>>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            checks: Arc::new(checks),
            metrics,
        }
    }
}
