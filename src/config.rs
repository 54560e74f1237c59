// src/config.rs - Production-ready configuration management
use config::{Config, Environment, File};
use kemgate_crypto::{KemAlgorithm, SigAlgorithm};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{ProxyError, ProxyResult};

/// Default location probed when `APP_CONFIG_FILE` is not set. The config
/// crate resolves the extension, so both `kemgate.yaml` and `kemgate.json`
/// work.
const DEFAULT_CONFIG_FILE: &str = "config/kemgate";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxySettings,
    pub backend: BackendSettings,
    pub tls: TlsSettings,
    pub quantum: QuantumSettings,
    pub renewal: RenewalSettings,
    pub rate_limiter: RateLimiterSettings,
    pub auth: AuthSettings,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    /// Hard ceiling on concurrent connections; excess accepts are closed
    /// immediately.
    pub max_connections: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            max_connections: 1024,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub host: String,
    pub port: u16,
    /// Optional `host:port` override; takes precedence over host/port.
    pub url: Option<String>,
    pub public_url: Option<String>,
    pub internal_url: Option<String>,
    pub use_tls: bool,
    /// Root used to verify the upstream when `use_tls` is set. Required in
    /// that case; the proxy does not bundle public roots.
    pub ca_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            url: None,
            public_url: None,
            internal_url: None,
            use_tls: false,
            ca_file: None,
            connect_timeout_secs: 10,
        }
    }
}

impl BackendSettings {
    /// Upstream dial address. Precedence: `url`, then `public_url` (the
    /// deployment-level override), then host/port.
    pub fn upstream_addr(&self) -> String {
        if let Some(url) = &self.url {
            return strip_to_authority(url);
        }
        if let Some(url) = &self.public_url {
            return strip_to_authority(url);
        }
        format!("{}:{}", self.host, self.port)
    }

    /// Hostname used for SNI when dialing the upstream over TLS.
    pub fn upstream_host(&self) -> String {
        let addr = self.upstream_addr();
        addr.rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or(addr)
    }
}

/// Reduce a service URL to a dialable `host:port`, defaulting the port
/// from the scheme when the URL does not carry one.
fn strip_to_authority(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", url),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.contains(':') {
        return authority.to_string();
    }
    match scheme {
        "https" | "tls" => format!("{authority}:443"),
        "http" => format!("{authority}:80"),
        _ => authority.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: Option<PathBuf>,
    pub use_hybrid: bool,
    /// Seconds between on-disk mtime scans.
    pub check_interval: u64,
    pub handshake_timeout_secs: u64,
    pub communication_service_url: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("config/tls/cert.pem"),
            key_file: PathBuf::from("config/tls/key.pem"),
            ca_file: None,
            use_hybrid: false,
            check_interval: 60,
            handshake_timeout_secs: 10,
            communication_service_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantumSettings {
    /// Secret name holding the KMS-wrapped KEM key pair envelope.
    pub key_name: Option<String>,
    /// KMS key used to unwrap the envelope's AES data key.
    pub kms_aes_key_name: Option<String>,
    pub kem_algorithm: KemAlgorithm,
    pub sig_algorithm: SigAlgorithm,
}

impl Default for QuantumSettings {
    fn default() -> Self {
        Self {
            key_name: None,
            kms_aes_key_name: None,
            kem_algorithm: KemAlgorithm::default(),
            sig_algorithm: SigAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalSettings {
    pub enable_auto_renewal: bool,
    /// Seconds between renewal eligibility checks.
    pub renewal_check_interval: u64,
    pub renewal_threshold_days: i64,
    pub domain: Option<String>,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            enable_auto_renewal: false,
            renewal_check_interval: 3600,
            renewal_threshold_days: 30,
            domain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub rate_limit: u32,
    pub per_seconds: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            rate_limit: 10,
            per_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Bearer-token validation is enabled only when a secret is configured.
    pub secret_key: Option<String>,
    pub algorithm: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret_key: None,
            algorithm: "HS256".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub metrics_port: u16,
    pub metrics_enabled: bool,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            metrics_enabled: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment.
    ///
    /// Layering, lowest to highest precedence: built-in defaults, the
    /// YAML/JSON config file, `APP_`-prefixed environment variables
    /// (nested keys separated by `__`, e.g. `APP_PROXY__PORT`), and finally
    /// the named service-URL overrides.
    pub fn load() -> ProxyResult<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let config_file =
            env::var("APP_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let raw = Config::builder()
            .add_source(File::with_name(&config_file).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()
            .map_err(|e| ProxyError::config(format!("failed to read configuration: {e}")))?;

        let mut config: AppConfig = raw
            .try_deserialize()
            .map_err(|e| ProxyError::config(format!("invalid configuration: {e}")))?;

        config.apply_service_url_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Named environment overrides kept for compatibility with the
    /// surrounding deployment tooling.
    fn apply_service_url_overrides(&mut self) {
        if let Ok(url) = env::var("PUBLIC_API_URL") {
            self.backend.public_url = Some(url);
        }
        if let Ok(url) = env::var("INTERNAL_API_URL") {
            self.backend.internal_url = Some(url);
        }
        if let Ok(url) = env::var("TLS_COMMUNICATION_SERVICE_URL") {
            self.tls.communication_service_url = Some(url);
        }
    }

    fn validate(&self) -> ProxyResult<()> {
        if self.rate_limiter.rate_limit == 0 {
            return Err(ProxyError::config("rate_limiter.rate_limit must be > 0"));
        }
        if self.rate_limiter.per_seconds == 0 {
            return Err(ProxyError::config("rate_limiter.per_seconds must be > 0"));
        }
        if self.proxy.max_connections == 0 {
            return Err(ProxyError::config("proxy.max_connections must be > 0"));
        }
        if self.backend.use_tls && self.backend.ca_file.is_none() {
            return Err(ProxyError::config(
                "backend.use_tls requires backend.ca_file (no public roots are bundled)",
            ));
        }
        if self.renewal.enable_auto_renewal && self.renewal.domain.is_none() {
            return Err(ProxyError::config(
                "renewal.enable_auto_renewal requires renewal.domain",
            ));
        }
        Ok(())
    }

    /// Whether KMS-backed KEM material is configured at all.
    pub fn kem_material_configured(&self) -> bool {
        self.quantum.key_name.is_some() && self.quantum.kms_aes_key_name.is_some()
    }
}
