//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpConfig {
    // =========================================================================
    // WeChat Official Account (公众号) Credentials
    // =========================================================================
    /// Shared token for webhook signature verification
    pub token: String,

    /// WeChat AppID
    pub app_id: String,

    /// WeChat AppSecret (used to fetch the access token)
    pub app_secret: String,

    // =========================================================================
    // Access Token Cache
    // =========================================================================
    /// Access token cache file
    #[serde(default = "default_tmp_name")]
    pub tmp_name: PathBuf,

    /// Refresh lock marker file (defaults to `tmp_name` + ".lck")
    #[serde(default)]
    pub lock_path: Option<PathBuf>,

    /// Upper bound applied to the platform-declared token lifetime
    #[serde(default = "default_max_token_lifetime")]
    pub max_token_lifetime_secs: u64,

    /// Maximum time to wait for another refresh to release the lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Poll interval while waiting on the refresh lock
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,

    // =========================================================================
    // Platform API
    // =========================================================================
    /// Base URL for the `cgi-bin` API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Base URL for the media API
    #[serde(default = "default_media_api_base")]
    pub media_api_base: String,

    /// Per-call HTTP timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Retry policy for authenticated calls
    #[serde(default)]
    pub retry: RetryPolicy,

    // =========================================================================
    // Webhook Server
    // =========================================================================
    /// Webhook server bind address
    #[serde(default = "default_webhook_addr")]
    pub webhook_addr: String,
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Cap on the delay between attempts
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
        }
    }
}

fn default_tmp_name() -> PathBuf {
    PathBuf::from("accesstoken.tmp")
}

fn default_max_token_lifetime() -> u64 {
    7200
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_lock_poll_interval() -> u64 {
    1000
}

fn default_api_base() -> String {
    "https://api.weixin.qq.com/cgi-bin/".to_string()
}

fn default_media_api_base() -> String {
    "https://api.weixin.qq.com/cgi-bin/media/".to_string()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_webhook_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl MpConfig {
    /// Create a configuration with defaults for everything but the credentials
    pub fn new(
        token: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            tmp_name: default_tmp_name(),
            lock_path: None,
            max_token_lifetime_secs: default_max_token_lifetime(),
            lock_timeout_secs: default_lock_timeout(),
            lock_poll_interval_ms: default_lock_poll_interval(),
            api_base: default_api_base(),
            media_api_base: default_media_api_base(),
            http_timeout_secs: default_http_timeout(),
            retry: RetryPolicy::default(),
            webhook_addr: default_webhook_addr(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let token = std::env::var("WEIXINMP_TOKEN").context("WEIXINMP_TOKEN is required")?;
        let app_id = std::env::var("WEIXINMP_APP_ID").context("WEIXINMP_APP_ID is required")?;
        let app_secret =
            std::env::var("WEIXINMP_APP_SECRET").context("WEIXINMP_APP_SECRET is required")?;

        let mut config = Self::new(token, app_id, app_secret);

        if let Ok(tmp_name) = std::env::var("WEIXINMP_TMP_NAME") {
            config.tmp_name = PathBuf::from(tmp_name);
        }
        config.lock_path = std::env::var("WEIXINMP_LOCK_PATH").ok().map(PathBuf::from);
        if let Ok(api_base) = std::env::var("WEIXINMP_API_BASE") {
            config.api_base = api_base;
        }
        if let Ok(media_api_base) = std::env::var("WEIXINMP_MEDIA_API_BASE") {
            config.media_api_base = media_api_base;
        }
        if let Ok(addr) = std::env::var("WEBHOOK_ADDR") {
            config.webhook_addr = addr;
        }
        config.http_timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.http_timeout_secs);
        config.retry.max_attempts = std::env::var("RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(config.retry.max_attempts);

        Ok(config)
    }

    /// Path of the refresh lock marker
    pub fn lock_path(&self) -> PathBuf {
        match &self.lock_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.tmp_name.clone().into_os_string();
                name.push(".lck");
                PathBuf::from(name)
            }
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lock_path() {
        let config = MpConfig::new("token", "wx123", "secret");
        assert_eq!(config.tmp_name, PathBuf::from("accesstoken.tmp"));
        assert_eq!(config.lock_path(), PathBuf::from("accesstoken.tmp.lck"));
    }

    #[test]
    fn test_explicit_lock_path() {
        let mut config = MpConfig::new("token", "wx123", "secret");
        config.lock_path = Some(PathBuf::from("/var/run/weixinmp.lock"));
        assert_eq!(config.lock_path(), PathBuf::from("/var/run/weixinmp.lock"));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(1), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(2000));
        assert_eq!(policy.backoff(70), Duration::from_millis(2000));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"token":"t","app_id":"wx1","app_secret":"s"}"#;
        let config: MpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_token_lifetime_secs, 7200);
        assert_eq!(config.api_base, "https://api.weixin.qq.com/cgi-bin/");
    }
}
