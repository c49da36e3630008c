//! Quota tracking types
//!
//! Identity, value, and reporting types shared by the store, the event bus,
//! and the synchronizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of every persisted counter key
pub const STORAGE_KEY_PREFIX: &str = "free_used";

/// Default number of free actions per resource kind
pub const DEFAULT_LIMIT: u32 = 5;

// ============================================================================
// Resource Kind
// ============================================================================

/// Category of metered action a quota applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// AI assistant questions
    AiChat,
    /// Any other metered action, identified by a lowercase slug
    Other(String),
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::AiChat => write!(f, "ai_chat"),
            ResourceKind::Other(slug) => write!(f, "{}", slug),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slug = s.trim().to_lowercase();
        match slug.as_str() {
            "ai_chat" | "ai-chat" | "chat" => Ok(ResourceKind::AiChat),
            "" => Err("Resource kind cannot be empty".to_string()),
            _ if slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                Ok(ResourceKind::Other(slug))
            }
            _ => Err(format!("Invalid resource kind: {}", s)),
        }
    }
}

// ============================================================================
// Quota Key
// ============================================================================

/// Composite identity of one quota: `(subject_id, resource_kind)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    /// Account the quota is scoped to
    pub subject_id: String,
    /// Category of metered action
    pub resource_kind: ResourceKind,
}

impl QuotaKey {
    pub fn new(subject_id: impl Into<String>, resource_kind: ResourceKind) -> Self {
        Self {
            subject_id: subject_id.into(),
            resource_kind,
        }
    }

    /// Namespaced key used in the local key-value store and in change notifications
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}",
            STORAGE_KEY_PREFIX, self.resource_kind, self.subject_id
        )
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.resource_kind)
    }
}

/// Parse a persisted counter value.
///
/// Corrupt, negative, or out-of-range values are treated as absent rather
/// than zero.
pub fn parse_stored_count(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('+') {
        return None;
    }
    trimmed.parse::<u32>().ok()
}

// ============================================================================
// Authoritative Values
// ============================================================================

/// A usage count as reported by the server, before validation
///
/// Server payloads are not trusted structurally: the count may be missing,
/// negative, fractional, a numeric string, or some other JSON type.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerValue {
    Missing,
    Integer(i64),
    Float(f64),
    Text(String),
    /// Any JSON type that can never be a count (bool, array, object)
    Malformed(String),
}

impl ServerValue {
    /// Validated, non-negative count, or `None` if the value must be rejected
    pub fn as_count(&self) -> Option<u32> {
        match self {
            ServerValue::Missing | ServerValue::Malformed(_) => None,
            ServerValue::Integer(n) => u32::try_from(*n).ok(),
            ServerValue::Float(f) => {
                if f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64 {
                    Some(*f as u32)
                } else {
                    None
                }
            }
            ServerValue::Text(s) => parse_stored_count(s),
        }
    }
}

impl std::fmt::Display for ServerValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerValue::Missing => write!(f, "<missing>"),
            ServerValue::Integer(n) => write!(f, "{}", n),
            ServerValue::Float(x) => write!(f, "{}", x),
            ServerValue::Text(s) => write!(f, "{:?}", s),
            ServerValue::Malformed(s) => write!(f, "<malformed {}>", s),
        }
    }
}

impl From<u32> for ServerValue {
    fn from(n: u32) -> Self {
        ServerValue::Integer(n as i64)
    }
}

impl From<i32> for ServerValue {
    fn from(n: i32) -> Self {
        ServerValue::Integer(n as i64)
    }
}

impl From<i64> for ServerValue {
    fn from(n: i64) -> Self {
        ServerValue::Integer(n)
    }
}

impl From<f64> for ServerValue {
    fn from(x: f64) -> Self {
        ServerValue::Float(x)
    }
}

impl From<&str> for ServerValue {
    fn from(s: &str) -> Self {
        ServerValue::Text(s.to_string())
    }
}

impl From<String> for ServerValue {
    fn from(s: String) -> Self {
        ServerValue::Text(s)
    }
}

impl<T: Into<ServerValue>> From<Option<T>> for ServerValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ServerValue::Missing)
    }
}

impl From<&serde_json::Value> for ServerValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ServerValue::Missing,
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ServerValue::Integer(i)
                } else if let Some(x) = n.as_f64() {
                    // u64 beyond i64::MAX lands here too and is rejected by range
                    ServerValue::Float(x)
                } else {
                    ServerValue::Malformed(n.to_string())
                }
            }
            Value::String(s) => ServerValue::Text(s.clone()),
            Value::Bool(b) => ServerValue::Malformed(format!("bool {}", b)),
            Value::Array(_) => ServerValue::Malformed("array".to_string()),
            Value::Object(_) => ServerValue::Malformed("object".to_string()),
        }
    }
}

impl From<serde_json::Value> for ServerValue {
    fn from(value: serde_json::Value) -> Self {
        ServerValue::from(&value)
    }
}

// ============================================================================
// Reporting Types
// ============================================================================

/// What the UI renders: displayed counts plus trustworthiness flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaView {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    /// Optimistic increments not yet reconciled
    pub pending: u32,
    /// `false` until the first load completes; `used` is then only a rendering default
    pub is_initialized: bool,
    pub is_exempt: bool,
    /// Physical time of the last accepted authoritative value
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl QuotaView {
    pub fn new(used: u32, limit: u32) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            pending: 0,
            is_initialized: false,
            is_exempt: false,
            last_synced_at: None,
        }
    }
}

/// Result of a `sync_from_server` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "value")]
pub enum SyncOutcome {
    /// Exempt, uninitialized, or no subject: nothing was fetched
    Skipped,
    /// Authoritative value adopted
    Accepted(u32),
    /// A later sync was already accepted; this result was discarded
    Stale,
    /// Server returned a missing/negative/non-numeric count
    Rejected,
    /// Fetch failed or timed out. `Some` is the stored value that was
    /// adopted; `None` means the in-memory value was kept, either because
    /// nothing is stored or because the store is behind memory.
    FellBack(Option<u32>),
}

// ============================================================================
// Tests
// ============================================================================
