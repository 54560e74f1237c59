// src/middleware/auth.rs - Optional bearer-token pre-filter
//
// Token validation happens after TLS termination, on the first cleartext
// chunk from the client, and only when a secret is configured. The chunk
// is scanned for an `Authorization: Bearer` header and forwarded upstream
// unmodified; nothing else of the payload is interpreted.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::AuthSettings;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{DenyReason, Verdict};

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Build a validator when `auth.secret_key` is configured, `None`
    /// otherwise (auth is then deferred to the layer behind the proxy).
    pub fn from_settings(auth: &AuthSettings) -> ProxyResult<Option<Self>> {
        let Some(secret) = &auth.secret_key else {
            return Ok(None);
        };

        let algorithm: Algorithm = auth.algorithm.parse().map_err(|_| {
            ProxyError::config(format!("unsupported auth.algorithm: {}", auth.algorithm))
        })?;

        Ok(Some(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(algorithm),
        }))
    }

    pub fn validate_token(&self, token: &str) -> bool {
        match decode::<serde_json::Value>(token, &self.decoding_key, &self.validation) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "authentication failed: invalid token");
                false
            }
        }
    }

    /// Gate a connection on the bearer token found in its first chunk.
    pub fn check_initial_bytes(&self, chunk: &[u8]) -> Verdict {
        match extract_bearer(chunk) {
            Some(token) if self.validate_token(token) => Verdict::Allow,
            Some(_) => Verdict::Deny(DenyReason::Unauthorized),
            None => {
                tracing::warn!("authentication failed: missing bearer token");
                Verdict::Deny(DenyReason::Unauthorized)
            }
        }
    }
}

/// Find an `Authorization: Bearer <token>` header line in the given chunk.
/// Scanning stops at the header/body boundary.
pub fn extract_bearer(chunk: &[u8]) -> Option<&str> {
    let headers = match find_subslice(chunk, b"\r\n\r\n") {
        Some(end) => &chunk[..end],
        None => chunk,
    };

    for line in headers.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((name, value)) = line.trim_end_matches('\r').split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("authorization") {
            return value.trim().strip_prefix("Bearer ").map(str::trim);
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
