//! Configuration loading for the PlantWatch client.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use plantwatch_cache::CacheConfig;
use plantwatch_core::DeviceId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Backend origin including the API prefix, e.g. `https://host/api/v1`.
    pub api_base_url: String,
    /// Confirmation socket base; the tenant id is appended as a path segment.
    pub ws_endpoint: String,
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
    /// Live telemetry refresh cadence.
    pub poll_interval_ms: u64,
    /// How long a bulk write waits for its confirmation.
    pub confirmation_timeout_ms: u64,
    pub cache: CacheSettings,
    pub persistence_path: PathBuf,
    pub telemetry_device_ids: Vec<i64>,
    pub log_format: LogFormat,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub telemetry_ttl_ms: u64,
    /// Unwatched stale entries older than this are swept.
    pub gc_window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt`, counted from zero after the
    /// last successful connect. Grows by `multiplier` up to `max_ms`, plus a
    /// random spread below `jitter_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self.initial_ms as f64 * self.multiplier.powi(attempt.min(64) as i32);
        let base = if grown.is_finite() {
            (grown as u64).min(self.max_ms)
        } else {
            self.max_ms
        };
        let spread = match self.jitter_ms {
            0 => 0,
            jitter => (Uuid::new_v4().as_u128() % u128::from(jitter)) as u64,
        };
        Duration::from_millis(base.saturating_add(spread))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or PLANTWATCH_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must be an http(s) URL".to_string(),
            });
        }
        if self.ws_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.ws_endpoint.starts_with("ws://") && !self.ws_endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must be a ws(s) URL".to_string(),
            });
        }
        if self.auth.api_key.is_none() && self.auth.jwt.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "auth",
                reason: "api_key or jwt must be provided".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.confirmation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "confirmation_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.telemetry_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.telemetry_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.telemetry_ttl_ms > self.poll_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "cache.telemetry_ttl_ms",
                reason: "must be <= poll_interval_ms".to_string(),
            });
        }
        if self.cache.gc_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.gc_window_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.persistence_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "persistence_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_default_ttl(Duration::from_millis(self.cache.default_ttl_ms))
            .with_telemetry_ttl(Duration::from_millis(self.cache.telemetry_ttl_ms))
            .with_gc_window(self.gc_window())
    }

    pub fn gc_window(&self) -> Duration {
        Duration::from_millis(self.cache.gc_window_ms)
    }

    pub fn telemetry_devices(&self) -> Vec<DeviceId> {
        self.telemetry_device_ids
            .iter()
            .copied()
            .map(DeviceId::new)
            .collect()
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("PLANTWATCH_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
api_base_url = "https://plants.example.com/api/v1"
ws_endpoint = "wss://plants.example.com/api/v1/ws"
request_timeout_ms = 5000
poll_interval_ms = 10000
confirmation_timeout_ms = 30000
persistence_path = "/tmp/plantwatch/state.json"
telemetry_device_ids = [2, 4]
log_format = "json"

[auth]
jwt = "token"

[cache]
default_ttl_ms = 300000
telemetry_ttl_ms = 5000
gc_window_ms = 600000

[reconnect]
initial_ms = 250
max_ms = 5000
multiplier = 1.5
jitter_ms = 100
"#;

    #[test]
    fn test_parse_sample() {
        let config = ClientConfig::from_toml(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(30));
        assert_eq!(config.telemetry_devices(), vec![DeviceId::new(2), DeviceId::new(4)]);
        assert_eq!(config.cache_config().telemetry_ttl, Duration::from_secs(5));
        assert_eq!(config.cache_config().gc_window, Duration::from_secs(600));
    }

    #[test]
    fn test_reconnect_delay_grows_to_cap() {
        let reconnect = ReconnectConfig {
            initial_ms: 250,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        let delays: Vec<u64> = (0..5).map(|n| reconnect.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1_000, 1_000, 1_000]);
        assert_eq!(reconnect.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_reconnect_jitter_is_bounded() {
        let reconnect = ReconnectConfig {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: 1.5,
            jitter_ms: 100,
        };
        for _ in 0..32 {
            let delay = reconnect.delay(0).as_millis() as u64;
            assert!((250..350).contains(&delay));
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let contents = SAMPLE.replace("[auth]", "theme = \"dark\"\n\n[auth]");
        assert!(matches!(
            ClientConfig::from_toml(&contents),
            Err(ConfigError::Parse(_))
        ));
    }
}
