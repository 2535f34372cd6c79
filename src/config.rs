use anyhow::{anyhow, Result};
use std::time::Duration;
use url::Url;

use crate::retry::RetryConfig;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tag attached to every engine log record.
    pub name: String,
    /// Interval for the periodic run-stats log. Zero disables it.
    pub stats_log_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "automation".to_string(),
            stats_log_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            name: std::env::var("ENGINE_NAME").unwrap_or(d.name),
            stats_log_secs: env_or("STATS_LOG_SECS", d.stats_log_secs),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletEnv {
    Dev,
    Sandbox,
    Prod,
}

impl WalletEnv {
    pub fn parse(s: &str) -> Self {
        match s {
            "sandbox" => WalletEnv::Sandbox,
            "prod" => WalletEnv::Prod,
            _ => WalletEnv::Dev,
        }
    }

    pub fn api_host(self) -> &'static str {
        match self {
            WalletEnv::Dev => "https://api.dev.cobo.com/v2",
            WalletEnv::Sandbox => "https://api.sandbox.cobo.com/v2",
            WalletEnv::Prod => "https://api.cobo.com/v2",
        }
    }
}

#[derive(Clone)]
pub struct WalletConfig {
    pub api_host: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Bearer token; takes precedence over key/secret signing when present.
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

// Hand-written so secrets never reach a log line through `{:?}`.
impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("api_host", &self.api_host)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "[REDACTED]"))
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WalletConfig {
    pub fn from_env() -> Self {
        let env = WalletEnv::parse(&std::env::var("COBO_ENV").unwrap_or_else(|_| "dev".to_string()));
        Self {
            api_host: std::env::var("COBO_API_HOST").unwrap_or_else(|_| env.api_host().to_string()),
            api_key: std::env::var("COBO_API_KEY").ok(),
            api_secret: std::env::var("COBO_API_SECRET").ok(),
            access_token: std::env::var("COBO_ACCESS_TOKEN").ok(),
            timeout: Duration::from_secs(env_or("WALLET_TIMEOUT_SECS", 15)),
            retry: RetryConfig::default(),
        }
    }

    pub fn for_host(api_host: impl Into<String>) -> Self {
        Self {
            api_host: api_host.into(),
            api_key: None,
            api_secret: None,
            access_token: None,
            timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
        }
    }

    /// Joins an API path onto the host, keeping the host's own path prefix (`/v2`).
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let base = if self.api_host.ends_with('/') {
            self.api_host.clone()
        } else {
            format!("{}/", self.api_host)
        };
        let base = Url::parse(&base).map_err(|e| anyhow!("invalid wallet api host {}: {}", self.api_host, e))?;
        Ok(base.join(path.trim_start_matches('/'))?)
    }
}
