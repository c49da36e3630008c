//! Client configuration
//!
//! Defaults overridable from `FREEQUOTA_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::services::quota::types::DEFAULT_LIMIT;

pub const ENV_API_URL: &str = "FREEQUOTA_API_URL";
pub const ENV_TOKEN: &str = "FREEQUOTA_TOKEN";
pub const ENV_TIMEOUT_SECS: &str = "FREEQUOTA_TIMEOUT_SECS";
pub const ENV_SYNC_TIMEOUT_MS: &str = "FREEQUOTA_SYNC_TIMEOUT_MS";
pub const ENV_LIMIT: &str = "FREEQUOTA_LIMIT";
pub const ENV_STORE_PATH: &str = "FREEQUOTA_STORE_PATH";

const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;
const MIN_SYNC_TIMEOUT_MS: u64 = 100;
const STORE_FILE_NAME: &str = "quota.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Not serialized
    #[serde(skip)]
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub sync_timeout: Duration,
    pub default_limit: u32,
    pub store_path: PathBuf,
}

impl ClientConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store_path = match var(ENV_STORE_PATH) {
            Some(path) => expand_path(&path),
            None => default_store_path()?,
        };

        let config = Self {
            api_base_url: var(ENV_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_token: var(ENV_TOKEN),
            request_timeout: Duration::from_secs(parse_or(
                ENV_TIMEOUT_SECS,
                var(ENV_TIMEOUT_SECS),
                DEFAULT_TIMEOUT_SECS,
            )),
            sync_timeout: Duration::from_millis(parse_or(
                ENV_SYNC_TIMEOUT_MS,
                var(ENV_SYNC_TIMEOUT_MS),
                DEFAULT_SYNC_TIMEOUT_MS,
            )),
            default_limit: parse_or(ENV_LIMIT, var(ENV_LIMIT), DEFAULT_LIMIT),
            store_path,
        };
        config.validate()
    }

    /// Reject unusable values and clamp the sync deadline.
    pub fn validate(mut self) -> Result<Self> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "{} must be an http(s) URL, got {:?}",
                ENV_API_URL, self.api_base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::validation(format!("{} must be positive", ENV_TIMEOUT_SECS)));
        }
        let min_sync = Duration::from_millis(MIN_SYNC_TIMEOUT_MS);
        if self.sync_timeout < min_sync {
            log::warn!(
                "[quota:config] sync timeout {:?} too small, using {:?}",
                self.sync_timeout,
                min_sync
            );
            self.sync_timeout = min_sync;
        }
        Ok(self)
    }

    pub fn with_store_path(mut self, path: impl AsRef<str>) -> Self {
        self.store_path = expand_path(path.as_ref());
        self
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!(
                "[quota:config] Invalid {} value {:?}, using default {}",
                name,
                raw,
                default
            );
            default
        }),
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Default store file in the platform data directory
pub fn default_store_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "freequota", "FreeQuota")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join(STORE_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ClientConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[(ENV_STORE_PATH, "/tmp/fq/quota.json")]).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:5000");
        assert_eq!(config.api_token, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.sync_timeout, Duration::from_millis(10_000));
        assert_eq!(config.default_limit, 5);
        assert_eq!(config.store_path, PathBuf::from("/tmp/fq/quota.json"));
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            (ENV_API_URL, "https://api.example.com"),
            (ENV_TOKEN, "secret"),
            (ENV_TIMEOUT_SECS, "5"),
            (ENV_SYNC_TIMEOUT_MS, "2500"),
            (ENV_LIMIT, "10"),
            (ENV_STORE_PATH, "/tmp/quota.json"),
        ])
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.sync_timeout, Duration::from_millis(2500));
        assert_eq!(config.default_limit, 10);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = load(&[
            (ENV_LIMIT, "lots"),
            (ENV_SYNC_TIMEOUT_MS, "-1"),
            (ENV_STORE_PATH, "/tmp/quota.json"),
        ])
        .unwrap();
        assert_eq!(config.default_limit, 5);
        assert_eq!(config.sync_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn test_blank_values_are_unset() {
        let config = load(&[(ENV_TOKEN, "   "), (ENV_STORE_PATH, "/tmp/quota.json")]).unwrap();
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn test_sync_timeout_is_clamped() {
        let config = load(&[(ENV_SYNC_TIMEOUT_MS, "5"), (ENV_STORE_PATH, "/tmp/q.json")]).unwrap();
        assert_eq!(config.sync_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = load(&[(ENV_API_URL, "ftp://x"), (ENV_STORE_PATH, "/tmp/q.json")]).unwrap_err();
        assert!(err.to_string().contains(ENV_API_URL));
    }

    #[test]
    fn test_rejects_zero_request_timeout() {
        assert!(load(&[(ENV_TIMEOUT_SECS, "0"), (ENV_STORE_PATH, "/tmp/q.json")]).is_err());
    }

    #[test]
    fn test_tilde_is_expanded() {
        let config = load(&[(ENV_STORE_PATH, "~/fq/quota.json")]).unwrap();
        assert!(!config.store_path.to_string_lossy().starts_with('~'));
        assert!(config.store_path.ends_with("fq/quota.json"));
    }

    #[test]
    fn test_token_is_not_serialized() {
        let config = load(&[(ENV_TOKEN, "secret"), (ENV_STORE_PATH, "/tmp/q.json")]).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
