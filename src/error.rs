// src/error.rs - Proxy-wide error taxonomy
use thiserror::Error;

/// Application-wide error types with detailed context.
///
/// The scoping rules matter more than the variants themselves:
/// connection-scoped errors (`Handshake`, `Upstream`, `RateLimited`,
/// `Unauthorized`) terminate exactly one connection; context-scoped errors
/// (`Credential`, `Renewal`) never terminate connections and never replace
/// a working TLS context; `Config` and startup-time `Credential` errors
/// abort the process before the listener binds.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] kemgate_crypto::CryptoError),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Upstream unreachable: {0}")]
    Upstream(String),

    #[error("Rate limit exceeded for client {client}")]
    RateLimited { client: String },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Certificate renewal failed: {0}")]
    Renewal(String),
}

impl ProxyError {
    /// Create a configuration error (convenience method)
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a credential error (convenience method)
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    /// Short kind tag used in log fields and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Credential(_) => "credential",
            Self::Crypto(_) => "crypto",
            Self::Handshake(_) => "handshake",
            Self::Upstream(_) => "upstream",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::Renewal(_) => "renewal",
        }
    }

    /// Whether this error terminates only the connection it occurred on
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Upstream(_) | Self::RateLimited { .. } | Self::Unauthorized(_)
        )
    }

    /// Check if error should be logged as an error vs warning
    pub fn should_log_as_error(&self) -> bool {
        match self {
            // Per-connection noise - log as warnings
            Self::Handshake(_) | Self::RateLimited { .. } | Self::Unauthorized(_) => false,

            // Infrastructure problems - log as errors
            Self::Config(_) | Self::Credential(_) | Self::Crypto(_) | Self::Upstream(_)
            | Self::Renewal(_) => true,
        }
    }
}

/// Result type used throughout the proxy
pub type ProxyResult<T> = Result<T, ProxyError>;
