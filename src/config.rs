use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::Subscription;

/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Environment variable overriding `apiKey`.
pub const API_KEY_ENV: &str = "INDEXSUPPLY_API_KEY";

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Bounds for the reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl RetryPolicy {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }.normalized()
    }

    /// Keeps `min_ms >= 1` and `max_ms >= min_ms`.
    pub fn normalized(self) -> Self {
        let min_ms = self.min_ms.max(1);
        Self {
            min_ms,
            max_ms: self.max_ms.max(min_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Process-wide configuration, read once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub api_key: String,

    /// Base URL of the live query API. Uses the public endpoint when unset.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Maximum concurrent webhook deliveries per subscription.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    pub subscriptions: Vec<Subscription>,
}

fn default_max_parallel() -> usize {
    10
}

impl Config {
    /// Parse a configuration document.
    pub fn from_json(path: &Path, raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw).map_err(|err| RelayError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(config.normalized())
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| RelayError::Config {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_json(path, &raw)
    }

    /// Load from `CONFIG_PATH` (default `config.json`) and apply the
    /// `INDEXSUPPLY_API_KEY` override.
    ///
    /// Returns the resolved path alongside the config for logging.
    pub fn from_env() -> Result<(PathBuf, Self)> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let path = std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path);

        let config = Self::load(&path)?
            .with_api_key_override(std::env::var(API_KEY_ENV).ok());
        Ok((path, config))
    }

    /// Replace the API key when an override is present and non-empty.
    pub fn with_api_key_override(mut self, api_key: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            self.api_key = key;
        }
        self
    }

    fn normalized(mut self) -> Self {
        self.max_parallel = self.max_parallel.max(1);
        self.retry = self.retry.normalized();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "apiKey": "secret",
        "maxParallel": 0,
        "retry": { "minMs": 0, "maxMs": 0 },
        "subscriptions": [
            {
                "name": "transfers",
                "chainId": 8453,
                "query": "select block_num from transfer",
                "signatures": ["Transfer(address indexed from, address indexed to, uint tokens)"],
                "webhook": { "url": "http://localhost:9000", "method": "PUT" },
                "cursorFile": "transfers.cursor",
                "initialBlock": 100
            }
        ]
    }"#;

    #[test]
    fn parses_and_normalizes() {
        let config = Config::from_json(Path::new("config.json"), SAMPLE).unwrap();

        assert_eq!(config.api_key, "secret");
        assert_eq!(config.max_parallel, 1);
        assert_eq!(config.retry, RetryPolicy { min_ms: 1, max_ms: 1 });
        assert_eq!(config.subscriptions.len(), 1);
        assert_eq!(config.subscriptions[0].initial_block, Some(100));
    }

    #[test]
    fn api_key_override_ignores_empty_values() {
        let config = Config::from_json(Path::new("config.json"), SAMPLE).unwrap();

        let config = config.with_api_key_override(Some(String::new()));
        assert_eq!(config.api_key, "secret");

        let config = config.with_api_key_override(Some("env-key".into()));
        assert_eq!(config.api_key, "env-key");
    }

    #[test]
    fn malformed_config_reports_path() {
        let err = Config::from_json(Path::new("broken.json"), "{").unwrap_err();
        assert!(matches!(err, RelayError::Config { ref path, .. } if path == Path::new("broken.json")));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }
}
