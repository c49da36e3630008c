//! HTTP quota source
//!
//! Talks to the two endpoints of the metered service:
//!
//! - `GET {base}/api/ai/chat/usage?trip_id={scope}` returns
//!   `{"questions_used": n, "limit": n | null, "is_premium": bool}`
//! - `POST {base}/api/ai/chat` performs the metered action. Success carries
//!   `questions_used` for free subjects; `403` means the limit was reached
//!   and also carries `questions_used`.
//!
//! The count is returned raw ([`ServerValue`]) so the synchronizer does the
//! validation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;

use super::action::{ActionResponse, CountReport};
use super::provider::{QuotaError, QuotaSource};
use super::types::{QuotaKey, ServerValue};

// ============================================================================
// Constants
// ============================================================================

const USAGE_PATH: &str = "/api/ai/chat/usage";

const CONSUME_PATH: &str = "/api/ai/chat";

/// Query/body parameter naming the server-side counting scope
const DEFAULT_SCOPE_PARAM: &str = "trip_id";

const REQUEST_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("freequota/", env!("CARGO_PKG_VERSION"));

/// Characters of a response body echoed into debug logs
const LOG_BODY_CHARS: usize = 200;

// ============================================================================
// Wire Types
// ============================================================================

/// Reply payload of a successful consume call
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(default)]
    pub needs_clarification: bool,
}

#[derive(Debug, Serialize)]
struct ConsumeRequest<'a> {
    message: &'a str,
    #[serde(flatten)]
    scope: serde_json::Map<String, serde_json::Value>,
    conversation_history: Vec<serde_json::Value>,
}

fn body_field(body: &serde_json::Value, field: &str) -> ServerValue {
    body.get(field)
        .map(ServerValue::from)
        .unwrap_or(ServerValue::Missing)
}

/// First `max` characters of `text`, cut on a char boundary
fn log_excerpt(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(i, _)| &text[..i])
}

fn error_message(body: &serde_json::Value, status: StatusCode) -> String {
    body.get("message")
        .or_else(|| body.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}

/// Extract the usage count from a usage endpoint body.
pub fn parse_usage_body(text: &str) -> Result<ServerValue, QuotaError> {
    let body: serde_json::Value = serde_json::from_str(text)?;
    if !body.is_object() {
        return Err(QuotaError::ParseError(
            "Usage response is not a JSON object".to_string(),
        ));
    }
    Ok(body_field(&body, "questions_used"))
}

/// Interpret a consume endpoint response.
pub fn parse_consume_body(
    status: StatusCode,
    text: &str,
) -> Result<ActionResponse<ChatReply>, QuotaError> {
    // Error pages are not always JSON
    let body: serde_json::Value = serde_json::from_str(text).unwrap_or(serde_json::Value::Null);

    if status == StatusCode::UNAUTHORIZED {
        return Err(QuotaError::Unauthorized(error_message(&body, status)));
    }
    if status == StatusCode::FORBIDDEN {
        let used = body_field(&body, "questions_used").as_count();
        return Err(QuotaError::QuotaExceeded { used });
    }
    if !status.is_success() {
        return Err(QuotaError::ApiError(format!(
            "HTTP {}: {}",
            status,
            error_message(&body, status)
        )));
    }

    if !body.is_object() {
        return Err(QuotaError::ParseError(
            "Chat response is not a JSON object".to_string(),
        ));
    }
    let reply: ChatReply = serde_json::from_value(body.clone()).map_err(|e| {
        log::error!("[quota:http] Failed to parse chat response: {}", e);
        QuotaError::ParseError(format!("Invalid chat response: {}", e))
    })?;
    let count = match body_field(&body, "questions_used").as_count() {
        Some(used) => CountReport::Authoritative(used),
        None => CountReport::Unavailable,
    };
    Ok(ActionResponse::new(reply, count))
}

// ============================================================================
// HttpQuotaSource
// ============================================================================

/// reqwest client for the usage and consume endpoints
pub struct HttpQuotaSource {
    client: Client,
    base_url: String,
    token: Option<String>,
    scope_param: String,
    /// Fixed scope value; defaults to the quota's subject id
    scope: Option<String>,
    usage_path: String,
    consume_path: String,
}

impl HttpQuotaSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            scope_param: DEFAULT_SCOPE_PARAM.to_string(),
            scope: None,
            usage_path: USAGE_PATH.to_string(),
            consume_path: CONSUME_PATH.to_string(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::with_timeout(&config.api_base_url, config.request_timeout)
            .with_token(config.api_token.clone())
    }

    /// Bearer token; empty strings count as none
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_scope(mut self, param: impl Into<String>, value: Option<String>) -> Self {
        self.scope_param = param.into();
        self.scope = value;
        self
    }

    pub fn with_usage_path(mut self, path: impl Into<String>) -> Self {
        self.usage_path = path.into();
        self
    }

    pub fn with_consume_path(mut self, path: impl Into<String>) -> Self {
        self.consume_path = path.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn usage_url(&self) -> String {
        format!("{}{}", self.base_url, self.usage_path)
    }

    pub fn consume_url(&self) -> String {
        format!("{}{}", self.base_url, self.consume_path)
    }

    fn scope_for(&self, key: &QuotaKey) -> String {
        self.scope.clone().unwrap_or_else(|| key.subject_id.clone())
    }

    fn token(&self) -> Result<&str, QuotaError> {
        self.token
            .as_deref()
            .ok_or_else(|| QuotaError::NotConfigured("No API token configured".to_string()))
    }

    /// Perform the metered action: send `message` and return the reply.
    pub async fn consume(
        &self,
        key: &QuotaKey,
        message: &str,
    ) -> Result<ActionResponse<ChatReply>, QuotaError> {
        let token = self.token()?;
        let mut scope = serde_json::Map::new();
        scope.insert(
            self.scope_param.clone(),
            serde_json::Value::String(self.scope_for(key)),
        );
        let request = ConsumeRequest {
            message,
            scope,
            conversation_history: Vec::new(),
        };

        log::info!("[quota:http] POST {} for {}", self.consume_url(), key);
        let response = self
            .client
            .post(self.consume_url())
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        log::debug!("[quota:http] Consume response status: {}", status);
        let text = response.text().await?;
        if !status.is_success() && status != StatusCode::FORBIDDEN {
            log::error!("[quota:http] Consume error: HTTP {} - {}", status, text);
        }
        parse_consume_body(status, &text)
    }
}

#[async_trait]
impl QuotaSource for HttpQuotaSource {
    fn source_id(&self) -> &'static str {
        "http"
    }

    async fn fetch_used(&self, key: &QuotaKey) -> Result<ServerValue, QuotaError> {
        let token = self.token()?;
        let scope = self.scope_for(key);

        log::debug!("[quota:http] GET {} for {}", self.usage_url(), key);
        let response = self
            .client
            .get(self.usage_url())
            .query(&[(self.scope_param.as_str(), scope.as_str())])
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::warn!("[quota:http] Authentication failed: HTTP {}", status);
            return Err(QuotaError::Unauthorized(format!(
                "Usage API authentication failed (HTTP {})",
                status
            )));
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            log::error!("[quota:http] Usage API error: HTTP {} - {}", status, error_body);
            return Err(QuotaError::ApiError(format!(
                "Usage API returned HTTP {}: {}",
                status, error_body
            )));
        }

        let text = response.text().await?;
        log::debug!(
            "[quota:http] Usage response body: {}",
            log_excerpt(&text, LOG_BODY_CHARS)
        );
        parse_usage_body(&text).map_err(|e| {
            log::error!("[quota:http] Failed to parse usage response: {}", e);
            e
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::quota::types::ResourceKind;

    fn key() -> QuotaKey {
        QuotaKey::new("42", ResourceKind::AiChat)
    }

    #[test]
    fn test_parse_usage_body() {
        let value = parse_usage_body(r#"{"questions_used": 3, "limit": 5, "is_premium": false}"#)
            .unwrap();
        assert_eq!(value.as_count(), Some(3));

        let premium =
            parse_usage_body(r#"{"questions_used": 0, "limit": null, "is_premium": true}"#).unwrap();
        assert_eq!(premium.as_count(), Some(0));
    }

    #[test]
    fn test_parse_usage_body_missing_or_garbage_count() {
        assert_eq!(parse_usage_body(r#"{"limit": 5}"#).unwrap(), ServerValue::Missing);
        assert_eq!(
            parse_usage_body(r#"{"questions_used": -2}"#).unwrap().as_count(),
            None
        );
        assert!(matches!(parse_usage_body("[1]"), Err(QuotaError::ParseError(_))));
        assert!(matches!(parse_usage_body("<html>"), Err(QuotaError::ParseError(_))));
    }

    #[test]
    fn test_parse_consume_success_with_count() {
        let response = parse_consume_body(
            StatusCode::OK,
            r#"{"response": "Try the night market.", "questions_used": 2, "limit": 5}"#,
        )
        .unwrap();
        assert_eq!(response.payload.response, "Try the night market.");
        assert_eq!(response.count, CountReport::Authoritative(2));
    }

    #[test]
    fn test_parse_consume_success_without_count() {
        let response =
            parse_consume_body(StatusCode::OK, r#"{"response": "Hello", "needs_clarification": true}"#)
                .unwrap();
        assert!(response.payload.needs_clarification);
        assert_eq!(response.count, CountReport::Unavailable);
    }

    #[test]
    fn test_parse_consume_zero_count_is_authoritative() {
        let response =
            parse_consume_body(StatusCode::OK, r#"{"response": "", "questions_used": 0}"#).unwrap();
        assert_eq!(response.count, CountReport::Authoritative(0));
    }

    #[test]
    fn test_parse_consume_limit_reached() {
        let err = parse_consume_body(
            StatusCode::FORBIDDEN,
            r#"{"error": "AI chat limit reached", "questions_used": 5, "limit": 5}"#,
        )
        .unwrap_err();
        assert!(matches!(err, QuotaError::QuotaExceeded { used: Some(5) }));

        let err = parse_consume_body(StatusCode::FORBIDDEN, "Forbidden").unwrap_err();
        assert!(matches!(err, QuotaError::QuotaExceeded { used: None }));
    }

    #[test]
    fn test_parse_consume_other_errors() {
        let err = parse_consume_body(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"response": "...", "error": "Service unavailable"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, QuotaError::ApiError(ref m) if m.contains("Service unavailable")));

        let err = parse_consume_body(StatusCode::UNAUTHORIZED, r#"{"error": "Invalid token"}"#)
            .unwrap_err();
        assert!(matches!(err, QuotaError::Unauthorized(_)));
    }

    #[test]
    fn test_urls_and_builders() {
        let source = HttpQuotaSource::new("http://localhost:5000/")
            .with_usage_path("/v2/usage")
            .with_scope("trip_id", Some("7".to_string()));
        assert_eq!(source.base_url(), "http://localhost:5000");
        assert_eq!(source.usage_url(), "http://localhost:5000/v2/usage");
        assert_eq!(source.consume_url(), "http://localhost:5000/api/ai/chat");
        assert_eq!(source.scope_for(&key()), "7");

        let default_scope = HttpQuotaSource::new("http://localhost:5000");
        assert_eq!(default_scope.scope_for(&key()), "42");
    }

    #[tokio::test]
    async fn test_missing_token_is_not_configured() {
        let source = HttpQuotaSource::new("http://127.0.0.1:9").with_token(Some("  ".to_string()));
        let err = source.fetch_used(&key()).await.unwrap_err();
        assert!(matches!(err, QuotaError::NotConfigured(_)));

        let err = source.consume(&key(), "hi").await.unwrap_err();
        assert!(matches!(err, QuotaError::NotConfigured(_)));
    }

    #[test]
    fn test_log_excerpt_respects_char_boundaries() {
        let body = format!("{}é{}", "a".repeat(199), "b".repeat(50));
        let excerpt = log_excerpt(&body, LOG_BODY_CHARS);
        assert_eq!(excerpt.chars().count(), 200);
        assert!(excerpt.ends_with('é'));

        assert_eq!(log_excerpt("短い", LOG_BODY_CHARS), "短い");
        assert_eq!(log_excerpt("", LOG_BODY_CHARS), "");
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(body: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_used_with_multibyte_body_and_debug_logging() {
        log::set_max_level(log::LevelFilter::Debug);
        let prefix = r#"{"questions_used": 2, "note": ""#;
        let padding = "a".repeat(199 - prefix.len());
        let body = format!(r#"{}{}é tail"}}"#, prefix, padding);
        assert!(!body.is_char_boundary(200));

        let base = serve_once(body).await;
        let source = HttpQuotaSource::new(base).with_token(Some("t".to_string()));
        let value = source.fetch_used(&key()).await.unwrap();
        assert_eq!(value.as_count(), Some(2));
    }

    #[test]
    fn test_consume_request_shape() {
        let mut scope = serde_json::Map::new();
        scope.insert("trip_id".to_string(), serde_json::json!("7"));
        let request = ConsumeRequest {
            message: "hi",
            scope,
            conversation_history: Vec::new(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"message": "hi", "trip_id": "7", "conversation_history": []})
        );
    }
}
