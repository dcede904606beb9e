//! Configuration module for meshdeck.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::lifecycle::LifecycleConfig;
use crate::scheduler::SchedulerConfig;

const PREFIX: &str = "MESHDECK_";

/// A bearer token accepted by the API and who it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub token: String,
    pub user: String,
    pub role: String,
}

impl FromStr for ApiToken {
    type Err = String;

    /// `token` or `token:user:role`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [token] if !token.is_empty() => Ok(Self {
                token: token.to_string(),
                user: "admin".to_string(),
                role: "admin".to_string(),
            }),
            [token, user, role] if !token.is_empty() && !user.is_empty() && !role.is_empty() => Ok(Self {
                token: token.to_string(),
                user: user.to_string(),
                role: role.to_string(),
            }),
            _ => Err("expected 'token' or 'token:user:role'".to_string()),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "meshdeck.db")
    pub db_path: String,
    pub api_tokens: Vec<ApiToken>,
    /// Base URL of the engine control API; `None` runs detached.
    pub engine_url: Option<String>,
    pub engine_token: Option<String>,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub test_timeout: Duration,
    pub node_stale: Duration,
    pub telemetry_retention: Duration,
    pub max_page_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "meshdeck.db".to_string(),
            api_tokens: Vec::new(),
            engine_url: None,
            engine_token: None,
            poll_interval: Duration::from_secs(30),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(3),
            node_stale: Duration::from_secs(300),
            telemetry_retention: Duration::from_secs(30 * 86400),
            max_page_size: 200,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `MESHDECK_*` environment variables.
    ///
    /// Environment variables:
    /// - `MESHDECK_HTTP_PORT`: HTTP port (default: 8080)
    /// - `MESHDECK_DB_PATH`: Database file path (default: "meshdeck.db")
    /// - `MESHDECK_API_TOKENS`: comma-separated `token` or `token:user:role`
    /// - `MESHDECK_ENGINE_URL`, `MESHDECK_ENGINE_TOKEN`: engine control API
    /// - `MESHDECK_POLL_INTERVAL_SECS` (30), `MESHDECK_START_TIMEOUT_SECS` (10),
    ///   `MESHDECK_STOP_TIMEOUT_SECS` (5), `MESHDECK_TEST_TIMEOUT_SECS` (3),
    ///   `MESHDECK_NODE_STALE_SECS` (300), `MESHDECK_TELEMETRY_RETENTION_SECS`
    ///   (30 days), `MESHDECK_MAX_PAGE_SIZE` (200)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(format!("{}{}", PREFIX, key)).ok())
    }

    /// Build from an arbitrary key lookup. Keys are given without prefix.
    /// Invalid values are logged and the default kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let parsed = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Config: ignoring invalid {}{}='{}'", PREFIX, key, raw);
                    None
                }
            }
        };
        let secs = |key: &str| parsed(key).filter(|v| *v > 0).map(Duration::from_secs);

        if let Some(port) = parsed("HTTP_PORT").and_then(|p| u16::try_from(p).ok()) {
            cfg.http_port = port;
        }
        if let Some(db_path) = lookup("DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(tokens) = lookup("API_TOKENS") {
            cfg.api_tokens = tokens
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .filter_map(|entry| match entry.parse() {
                    Ok(token) => Some(token),
                    Err(e) => {
                        tracing::warn!("Config: ignoring API token entry: {}", e);
                        None
                    }
                })
                .collect();
        }
        cfg.engine_url = lookup("ENGINE_URL").filter(|u| !u.trim().is_empty());
        cfg.engine_token = lookup("ENGINE_TOKEN").filter(|t| !t.is_empty());

        if let Some(d) = secs("POLL_INTERVAL_SECS") {
            cfg.poll_interval = d;
        }
        if let Some(d) = secs("START_TIMEOUT_SECS") {
            cfg.start_timeout = d;
        }
        if let Some(d) = secs("STOP_TIMEOUT_SECS") {
            cfg.stop_timeout = d;
        }
        if let Some(d) = secs("TEST_TIMEOUT_SECS") {
            cfg.test_timeout = d;
        }
        if let Some(d) = secs("NODE_STALE_SECS") {
            cfg.node_stale = d;
        }
        if let Some(d) = secs("TELEMETRY_RETENTION_SECS") {
            cfg.telemetry_retention = d;
        }
        if let Some(size) = parsed("MAX_PAGE_SIZE").filter(|v| *v > 0) {
            cfg.max_page_size = u32::try_from(size).unwrap_or(u32::MAX);
        }

        cfg
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            start_timeout: self.start_timeout,
            stop_timeout: self.stop_timeout,
            test_timeout: self.test_timeout,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            node_stale: self.node_stale,
            retention: self.telemetry_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "meshdeck.db");
        assert!(cfg.engine_url.is_none());
        assert_eq!(cfg.lifecycle().start_timeout, Duration::from_secs(10));
        assert_eq!(cfg.scheduler().node_stale, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides_and_tokens() {
        let cfg = load(&[
            ("HTTP_PORT", "9090"),
            ("API_TOKENS", "abc, ops-key:alice:operator ,bad:entry"),
            ("ENGINE_URL", "http://127.0.0.1:7000"),
            ("STOP_TIMEOUT_SECS", "2"),
            ("MAX_PAGE_SIZE", "50"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.engine_url.as_deref(), Some("http://127.0.0.1:7000"));
        assert_eq!(cfg.stop_timeout, Duration::from_secs(2));
        assert_eq!(cfg.max_page_size, 50);

        assert_eq!(cfg.api_tokens.len(), 2);
        assert_eq!(cfg.api_tokens[0].user, "admin");
        assert_eq!(
            cfg.api_tokens[1],
            ApiToken {
                token: "ops-key".to_string(),
                user: "alice".to_string(),
                role: "operator".to_string(),
            }
        );
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load(&[("HTTP_PORT", "99999"), ("START_TIMEOUT_SECS", "0"), ("POLL_INTERVAL_SECS", "soon")]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.start_timeout, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
    }
}
