use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_u16(key: &str, default: u16) -> Result<u16> {
    let v = get_env_u64(key, u64::from(default))?;
    u16::try_from(v).map_err(|_| anyhow!("{key} out of range for a port: {v}"))
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    // Backend
    pub backend_url: String,
    /// Fallback bearer token used when a request carries none.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub http_timeout_secs: u64,

    // Cache / storage
    pub sqlite_path: String,
    pub accounts_cache_ttl_secs: u64,

    // Dashboard
    pub dashboard_enabled: bool,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub dashboard_enable_reset: bool,
    pub dashboard_open_browser: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("backend_url", &self.backend_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("sqlite_path", &self.sqlite_path)
            .field("accounts_cache_ttl_secs", &self.accounts_cache_ttl_secs)
            .field("dashboard_enabled", &self.dashboard_enabled)
            .field("dashboard_host", &self.dashboard_host)
            .field("dashboard_port", &self.dashboard_port)
            .field("dashboard_enable_reset", &self.dashboard_enable_reset)
            .field("dashboard_open_browser", &self.dashboard_open_browser)
            .finish()
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let backend_url = get_env_string("BACKEND_URL", "http://localhost:1337")
            .trim_end_matches('/')
            .to_string();

        let s = Self {
            backend_url,
            api_token: get_env("API_TOKEN"),
            http_timeout_secs: get_env_u64("HTTP_TIMEOUT_SECS", 10)?,
            sqlite_path: get_env_string("SQLITE_PATH", "./data/metrix.sqlite"),
            accounts_cache_ttl_secs: get_env_u64("ACCOUNTS_CACHE_TTL_SECS", 60)?,
            dashboard_enabled: get_env_bool("DASHBOARD_ENABLED", true),
            dashboard_host: get_env_string("DASHBOARD_HOST", "127.0.0.1"),
            dashboard_port: get_env_u16("DASHBOARD_PORT", 8000)?,
            dashboard_enable_reset: get_env_bool("DASHBOARD_ENABLE_RESET", false),
            dashboard_open_browser: get_env_bool("DASHBOARD_OPEN_BROWSER", false),
        };

        s.validate()?;
        Ok(s)
    }

    /// Bearer token for a call: the caller's own session first, then the configured fallback.
    pub fn bearer<'a>(&'a self, from_request: Option<&'a str>) -> Option<&'a str> {
        from_request
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or(self.api_token.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(anyhow!(
                "BACKEND_URL must start with http:// or https:// (got {})",
                self.backend_url
            ));
        }
        if self.http_timeout_secs < 1 {
            return Err(anyhow!(
                "HTTP_TIMEOUT_SECS must be >= 1 (got {})",
                self.http_timeout_secs
            ));
        }
        if self.sqlite_path.trim().is_empty() {
            return Err(anyhow!("SQLITE_PATH must not be empty"));
        }
        if self.dashboard_port == 0 {
            return Err(anyhow!("DASHBOARD_PORT must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_settings(backend_url: &str, sqlite_path: &str) -> Settings {
    Settings {
        backend_url: backend_url.trim_end_matches('/').to_string(),
        api_token: None,
        http_timeout_secs: 5,
        sqlite_path: sqlite_path.to_string(),
        accounts_cache_ttl_secs: 60,
        dashboard_enabled: false,
        dashboard_host: "127.0.0.1".to_string(),
        dashboard_port: 8000,
        dashboard_enable_reset: false,
        dashboard_open_browser: false,
    }
}
