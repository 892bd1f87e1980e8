//! Remote client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tarotsync_common::{Error, Result};

/// Default API base URL for development servers.
const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// Configuration shared by the transport client and token authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL every endpoint path is appended to.
    pub api_base_url: String,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// How long before expiry the proactive refresh fires, in seconds.
    pub refresh_margin_secs: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_ms: 10_000,
            refresh_margin_secs: 300,
            user_agent: format!("TarotSync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `api_base_url` with default timings.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Check the base URL and normalize away any trailing slash.
    ///
    /// # Errors
    /// - Base URL is not an absolute http(s) URL
    /// - Timeout is zero
    pub fn validated(mut self) -> Result<Self> {
        let parsed = url::Url::parse(&self.api_base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid API base URL: {}", e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "API base URL must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "Request timeout must be positive".to_string(),
            ));
        }

        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        i64::try_from(self.refresh_margin_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Full URL for an endpoint path such as `/spreads`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = ClientConfig::new("https://api.example.com/api/")
            .validated()
            .unwrap();
        assert_eq!(config.endpoint("/spreads"), "https://api.example.com/api/spreads");
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(ClientConfig::new("not a url").validated().is_err());
        assert!(ClientConfig::new("ftp://example.com").validated().is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = ClientConfig {
            request_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"api_base_url":"https://tarot.example.com"}"#).unwrap();
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.refresh_margin_secs, 300);
        assert_eq!(config.refresh_margin(), chrono::Duration::minutes(5));
    }
}
