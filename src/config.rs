// config.rs - recognized configuration options
//
// Loaded once by the binary entry point and passed by value into every
// component's constructor; there is no process-wide singleton (DESIGN
// NOTES). Shape follows the reference pack's `ClientConfig` /
// `RetryConfig` / `TimeoutConfig` split (nested sub-configs, each with
// its own defaults).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub push: PushConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = self.server.timeout.as_secs();
        if !(1..=300).contains(&t) {
            return Err(Error::Config("server.timeout_s must be in 1..=300".into()));
        }
        if self.sync.interval.as_secs() < 5 {
            return Err(Error::Config("sync.interval_s must be >= 5".into()));
        }
        if self.push.ping_interval.as_secs() < 1 {
            return Err(Error::Config("push.ping_interval_s must be >= 1".into()));
        }
        if self.push.max_queued_events < 64 {
            return Err(Error::Config("push.max_queued_events must be >= 64".into()));
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(Error::Config("retry.max_attempts must be in 1..=10".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9080".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub skew_tolerance: Duration,
    /// Per-sync-pass timeout.
    #[serde(with = "duration_secs")]
    pub pass_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            skew_tolerance: Duration::from_secs(2),
            pass_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,
    pub max_queued_events: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            max_queued_events: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(30_000),
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { cache_enabled: true }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.server.url, "http://localhost:9080");
        assert_eq!(config.server.timeout, Duration::from_secs(30));
        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.skew_tolerance, Duration::from_secs(2));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.storage.cache_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut config = Config::default();
        config.server.timeout = Duration::from_secs(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_override() {
        let toml = r#"
            [server]
            url = "https://example.com"
            timeout = 45

            [sync]
            interval = 120
            skew_tolerance = 3
            pass_timeout = 200
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.url, "https://example.com");
        assert_eq!(config.sync.interval, Duration::from_secs(120));
        // Unspecified sections still take their defaults.
        assert_eq!(config.retry.max_attempts, 5);
    }
}
