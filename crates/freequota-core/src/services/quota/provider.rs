//! Remote quota source trait and error types
//!
//! Defines the interface to the server that owns the authoritative count.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{QuotaKey, ServerValue};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when talking to the remote quota source
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Source is missing required configuration (base URL, token, scope)
    #[error("Source not configured: {0}")]
    NotConfigured(String),

    /// Authentication failed or token is invalid
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The server refused the metered action because the limit is reached
    #[error("Quota exceeded (used: {used:?})")]
    QuotaExceeded { used: Option<u32> },

    /// API returned an error
    #[error("API error: {0}")]
    ApiError(String),

    /// Failed to parse API response
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Network request failed
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The request did not complete within the caller's deadline
    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

impl From<reqwest::Error> for QuotaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QuotaError::NetworkError("Request timed out".to_string())
        } else if err.is_connect() {
            QuotaError::NetworkError("Connection failed".to_string())
        } else if err.is_status() {
            match err.status() {
                Some(status) if status.as_u16() == 401 => {
                    QuotaError::Unauthorized("Invalid or expired credentials".to_string())
                }
                Some(status) => QuotaError::ApiError(format!("HTTP {}", status)),
                None => QuotaError::NetworkError(err.to_string()),
            }
        } else if err.is_decode() {
            QuotaError::ParseError(err.to_string())
        } else {
            QuotaError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::ParseError(err.to_string())
    }
}

// ============================================================================
// Source Trait
// ============================================================================

/// The server's view of how many metered actions a subject has consumed
///
/// The synchronizer calls this but never implements it. Every failure mode
/// (non-2xx, malformed body, timeout) is handled identically by the caller:
/// "fetch failed", fall back to the local value.
///
/// # Example Implementation
///
/// ```ignore
/// use async_trait::async_trait;
/// use freequota_core::services::quota::{QuotaError, QuotaKey, QuotaSource, ServerValue};
///
/// struct FixedSource(u32);
///
/// #[async_trait]
/// impl QuotaSource for FixedSource {
///     fn source_id(&self) -> &'static str {
///         "fixed"
///     }
///
///     async fn fetch_used(&self, _key: &QuotaKey) -> Result<ServerValue, QuotaError> {
///         Ok(ServerValue::from(self.0))
///     }
/// }
/// ```
#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// Short identifier used in log lines
    fn source_id(&self) -> &'static str;

    /// Fetch the authoritative `used` count for `key`
    ///
    /// Returns the raw value so that validation stays in one place (the
    /// synchronizer), including the case where the server sends garbage.
    async fn fetch_used(&self, key: &QuotaKey) -> Result<ServerValue, QuotaError>;
}

// ============================================================================
// Tests
// ============================================================================
