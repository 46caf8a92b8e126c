//! Configuration file parser for `~/.config/feedbox/config.toml`.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

/// Runtime settings for the store, the HTTP transport and refreshes.
///
/// Every key is optional; missing keys take the value from
/// [`Config::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding feeds, articles and folders. Defaults to
    /// `feedbox.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Feed relay queried as `GET <endpoint>?feedUrl=<url>` instead of
    /// fetching feeds directly.
    pub proxy_endpoint: Option<String>,

    pub user_agent: String,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,

    /// Upper bound on fetching one feed during a refresh, retries included.
    /// 0 = no deadline.
    pub refresh_deadline_secs: u64,

    pub max_concurrent_refreshes: usize,

    pub max_feed_size_bytes: usize,

    /// Retries after a 429 or 5xx response.
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            proxy_endpoint: None,
            user_agent: concat!("feedbox/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 30,
            refresh_deadline_secs: 0,
            max_concurrent_refreshes: 10,
            max_feed_size_bytes: 10 * 1024 * 1024,
            max_retries: 3,
        }
    }
}

impl Config {
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "database_path",
        "proxy_endpoint",
        "user_agent",
        "request_timeout_secs",
        "refresh_deadline_secs",
        "max_concurrent_refreshes",
        "max_feed_size_bytes",
        "max_retries",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - File over 1 MiB → `Err(ConfigError::TooLarge)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            // Deleted between metadata and read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            proxy = config.proxy_endpoint.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn refresh_deadline(&self) -> Option<Duration> {
        (self.refresh_deadline_secs > 0).then(|| Duration::from_secs(self.refresh_deadline_secs))
    }
}
