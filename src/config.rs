// Configuration File Support
//
// Settings come from an optional TOML file, then environment overrides, then
// validation. Every section has defaults, so an empty file (or none) is a
// valid configuration apart from the remote endpoint URLs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DEFAULT_BURST_SIZE;
use crate::profile::{ProfileFields, DEFAULT_DISPLAY_NAME_POINTER, DEFAULT_LIKE_COUNT_POINTER};
use crate::quota::DEFAULT_DAILY_LIMIT;
use crate::tokens::pool::DEFAULT_ISSUE_CONCURRENCY;
use crate::tokens::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    pub issuer: IssuerConfig,
    pub refresh: RefreshConfig,
    pub quota: QuotaConfig,
    pub dispatch: DispatchConfig,
    pub profile: ProfileConfig,
    pub logging: LoggingConfig,
}

/// Inbound HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Values accepted in the `key` query parameter
    pub access_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            access_keys: Vec::new(),
        }
    }
}

/// Credential store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accs.txt"),
        }
    }
}

/// Token issuer endpoint and retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IssuerConfig {
    pub url: String,
    pub timeout_secs: u64,

    /// Attempts per credential, first call included
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 30,
            max_attempts: 6,
            base_delay_ms: 1000,
            max_delay_secs: 30,
        }
    }
}

impl IssuerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_secs(self.max_delay_secs))
    }
}

/// Background refresh cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,

    /// Issuance calls in flight during one cycle
    pub concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            concurrency: DEFAULT_ISSUE_CONCURRENCY,
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Effective batches per token per local day
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
        }
    }
}

/// Remote action endpoint and burst shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub url: String,
    pub burst_size: usize,
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            burst_size: DEFAULT_BURST_SIZE,
            timeout_secs: 10,
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Remote profile endpoint and field locations (JSON pointers)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub like_count_pointer: String,
    pub display_name_pointer: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 10,
            like_count_pointer: DEFAULT_LIKE_COUNT_POINTER.to_string(),
            display_name_pointer: DEFAULT_DISPLAY_NAME_POINTER.to_string(),
        }
    }
}

impl ProfileConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fields(&self) -> ProfileFields {
        ProfileFields {
            like_count: self.like_count_pointer.clone(),
            display_name: self.display_name_pointer.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path` if given, otherwise defaults; then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// `PORT` and `ACCS_FILE` are honoured for drop-in compatibility with
    /// existing deployments; the `LIKEPOOL_*` forms take precedence.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(port) = var("LIKEPOOL_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = var("LIKEPOOL_HOST") {
            self.server.host = host;
        }
        if let Some(keys) = var("LIKEPOOL_ACCESS_KEYS") {
            self.server.access_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(path) = var("ACCS_FILE") {
            self.credentials.path = PathBuf::from(path);
        }
        if let Some(path) = var("LIKEPOOL_CREDENTIALS_FILE") {
            self.credentials.path = PathBuf::from(path);
        }

        if let Some(url) = var("LIKEPOOL_ISSUER_URL") {
            self.issuer.url = url;
        }
        if let Some(url) = var("LIKEPOOL_DISPATCH_URL") {
            self.dispatch.url = url;
        }
        if let Some(url) = var("LIKEPOOL_PROFILE_URL") {
            self.profile.url = url;
        }

        if let Some(secs) = parsed("LIKEPOOL_REFRESH_INTERVAL_SECS") {
            self.refresh.interval_secs = secs;
        }
        if let Some(limit) = parsed("LIKEPOOL_DAILY_LIMIT") {
            self.quota.daily_limit = limit.min(u32::MAX as u64) as u32;
        }
        if let Some(size) = parsed("LIKEPOOL_BURST_SIZE") {
            self.dispatch.burst_size = size as usize;
        }

        if let Some(level) = var("LIKEPOOL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LIKEPOOL_LOG_FORMAT") {
            self.logging.format = format;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        for (name, url) in [
            ("issuer.url", &self.issuer.url),
            ("dispatch.url", &self.dispatch.url),
            ("profile.url", &self.profile.url),
        ] {
            if url.trim().is_empty() {
                anyhow::bail!("{} must be set", name);
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL, got {}", name, url);
            }
        }

        if self.quota.daily_limit == 0 {
            anyhow::bail!("Daily quota limit must be > 0");
        }
        if self.dispatch.burst_size == 0 {
            anyhow::bail!("Burst size must be > 0");
        }
        if self.refresh.interval_secs < 60 {
            anyhow::bail!("Refresh interval must be at least 60 seconds");
        }
        if self.refresh.concurrency == 0 {
            anyhow::bail!("Refresh concurrency must be > 0");
        }
        if self.issuer.max_attempts == 0 {
            anyhow::bail!("Issuer max_attempts must be > 0");
        }
        for (name, secs) in [
            ("issuer.timeout_secs", self.issuer.timeout_secs),
            ("dispatch.timeout_secs", self.dispatch.timeout_secs),
            ("profile.timeout_secs", self.profile.timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be > 0", name);
            }
        }
        for (name, pointer) in [
            ("profile.like_count_pointer", &self.profile.like_count_pointer),
            ("profile.display_name_pointer", &self.profile.display_name_pointer),
        ] {
            if !pointer.starts_with('/') {
                anyhow::bail!("{} must be a JSON pointer starting with '/'", name);
            }
        }
        if self.server.access_keys.is_empty() {
            tracing::warn!("No access keys configured, every keyed route will answer 403");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// TOML rendering with access keys masked
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        shown.server.access_keys = shown
            .server
            .access_keys
            .iter()
            .map(|_| "***".to_string())
            .collect();
        toml::to_string_pretty(&shown).context("Failed to render configuration")
    }
}
