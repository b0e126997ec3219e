//! Configuration loading and defaults for agent-runtime.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2024;
pub const DEFAULT_MAX_TIMER_WAIT_SECS: u64 = 24 * 60 * 60;

// === Types ===

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 0.1,
            max_delay: 2.0,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // Clamp to a sane range to guard against NaN/negative from misconfigured values
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

impl StorageBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmem" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => anyhow::bail!("Invalid storage backend '{other}': expected memory or postgres."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub pool_min_size: usize,
    pub pool_max_size: usize,
    pub acquire_timeout_secs: u64,
    pub retry: Option<RetryConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            pool_min_size: 1,
            pool_max_size: 10,
            acquire_timeout_secs: 5,
            retry: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the effective retry policy with defaults applied.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Hard deadline for a single run.
    pub timeout_secs: u64,
    /// How long a cancelled run may take to acknowledge before it is forced.
    pub cancel_grace_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Finished streams kept in memory for byte-identical reconnect replay.
    pub stream_retention: usize,
    pub webhook_timeout_secs: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            cancel_grace_secs: 5,
            shutdown_grace_secs: 10,
            stream_retention: 256,
            webhook_timeout_secs: 10,
        }
    }
}

impl RunsConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Longest single timer wait; longer waits are split and re-checked.
    pub max_timer_wait_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_timer_wait_secs: DEFAULT_MAX_TIMER_WAIT_SECS,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn max_timer_wait(&self) -> Duration {
        Duration::from_secs(self.max_timer_wait_secs)
    }
}

/// Resolved server configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runs: RunsConfig,
    pub scheduler: SchedulerConfig,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match resolve_config_path(path) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host cannot be empty");
        }
        if self.storage.pool_max_size == 0 {
            anyhow::bail!("storage.pool_max_size must be at least 1");
        }
        if self.storage.pool_min_size > self.storage.pool_max_size {
            anyhow::bail!(
                "storage.pool_min_size ({}) exceeds storage.pool_max_size ({})",
                self.storage.pool_min_size,
                self.storage.pool_max_size
            );
        }
        if self.storage.backend == StorageBackend::Postgres
            && self
                .storage
                .database_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            anyhow::bail!("storage.database_url (or DATABASE_URL) is required for postgres");
        }
        if self.runs.timeout_secs == 0 {
            anyhow::bail!("runs.timeout_secs must be greater than zero");
        }
        if self.runs.stream_retention == 0 {
            anyhow::bail!("runs.stream_retention must be at least 1");
        }
        if self.scheduler.max_timer_wait_secs == 0 {
            anyhow::bail!("scheduler.max_timer_wait_secs must be greater than zero");
        }
        Ok(())
    }

    /// Socket address string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// === Defaults ===

fn resolve_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if path.is_some() {
        return path;
    }
    std::env::var("AGENT_RUNTIME_CONFIG")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("Invalid {key} '{value}': {err}"))
}

fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup("AGENT_RUNTIME_HOST") {
        config.server.host = value;
    }
    if let Some(value) = lookup("AGENT_RUNTIME_PORT") {
        config.server.port = parse_env("AGENT_RUNTIME_PORT", &value)?;
    }
    if let Some(value) = lookup("AGENT_RUNTIME_STORAGE") {
        config.storage.backend = value.parse()?;
    }
    if let Some(value) = lookup("DATABASE_URL") {
        config.storage.database_url = Some(value);
    }
    if let Some(value) = lookup("AGENT_RUNTIME_POOL_MAX_SIZE") {
        config.storage.pool_max_size = parse_env("AGENT_RUNTIME_POOL_MAX_SIZE", &value)?;
    }
    if let Some(value) = lookup("AGENT_RUNTIME_RUN_TIMEOUT_SECS") {
        config.runs.timeout_secs = parse_env("AGENT_RUNTIME_RUN_TIMEOUT_SECS", &value)?;
    }
    if let Some(value) = lookup("AGENT_RUNTIME_SCHEDULER") {
        config.scheduler.enabled = value == "1" || value.eq_ignore_ascii_case("true");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = Config::default();
        config.validate()?;
        assert_eq!(config.bind_addr(), "127.0.0.1:2024");
        assert_eq!(
            config.scheduler.max_timer_wait(),
            Duration::from_secs(86_400)
        );
        Ok(())
    }

    #[test]
    fn file_sections_override_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[server]
port = 9000

[storage]
backend = "postgres"
database_url = "postgres://localhost/agents"
pool_max_size = 4

[storage.retry]
max_retries = 7

[runs]
timeout_secs = 30
"#
        )?;
        let config = Config::from_file(file.path())?;
        config.validate()?;
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.pool_max_size, 4);
        assert_eq!(config.storage.retry_policy().max_retries, 7);
        assert_eq!(config.runs.timeout(), Duration::from_secs(30));
        assert_eq!(config.runs.cancel_grace_secs, 5);
        Ok(())
    }

    #[test]
    fn env_overrides_win_over_file_values() -> Result<()> {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                ("AGENT_RUNTIME_PORT", "8123"),
                ("AGENT_RUNTIME_STORAGE", "postgres"),
                ("DATABASE_URL", "postgres://db/agents"),
                ("AGENT_RUNTIME_RUN_TIMEOUT_SECS", "12"),
            ]),
        )?;
        config.validate()?;
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.runs.timeout_secs, 12);
        Ok(())
    }

    #[test]
    fn invalid_env_values_are_reported() {
        let mut config = Config::default();
        let err = apply_env_overrides(&mut config, lookup(&[("AGENT_RUNTIME_PORT", "http")]))
            .expect_err("bad port");
        assert!(err.to_string().contains("AGENT_RUNTIME_PORT"));
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            enabled: true,
            max_retries: 5,
            initial_delay: 0.5,
            max_delay: 2.0,
            exponential_base: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }
}
