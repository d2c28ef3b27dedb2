//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Durations use the humantime grammar
//! (`"30s"`, `"5m"`, `"1h 30m"`).
//!
//! ```yaml
//! queue:
//!   maxRetries: 3
//!   backend:
//!     type: redis
//!     url: redis://arena-redis:6379
//!     db: 2
//!     keyPrefix: arena
//!     jobTtl: 24h
//! aggregator:
//!   readTimeout: 30s
//!   outputFormat: json
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use arena_core::OutputFormat;

/// Environment variable consulted for the shared-store password.
pub const REDIS_PASSWORD_ENV: &str = "ARENA_REDIS_PASSWORD";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArenaConfig {
    pub queue: QueueConfig,
    pub aggregator: AggregatorConfig,
}

impl ArenaConfig {
    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: ArenaConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ArenaConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        config.apply_env();
        Ok(config)
    }

    /// Fill secrets from the environment when the file does not set them.
    pub fn apply_env(&mut self) {
        if let QueueBackendConfig::Redis(redis) = &mut self.queue.backend {
            if redis.password.is_none() {
                if let Ok(password) = std::env::var(REDIS_PASSWORD_ENV) {
                    redis.password = Some(SecretString::from(password));
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregator.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "aggregator.readTimeout must be greater than zero".to_string(),
            ));
        }

        if let QueueBackendConfig::Redis(redis) = &self.queue.backend {
            if redis.url.is_empty() {
                return Err(ConfigError::Invalid("queue.backend.url is required".to_string()));
            }
            if redis.key_prefix.is_empty() {
                return Err(ConfigError::Invalid(
                    "queue.backend.keyPrefix must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Work queue settings.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Attempts per item before it is finalized as failed
    pub max_retries: u32,

    pub backend: QueueBackendConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backend: QueueBackendConfig::Memory,
        }
    }
}

/// Which queue implementation to construct.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackendConfig {
    /// Single-process queue for tests and single-node jobs
    #[default]
    Memory,

    /// Shared-store queue for multi-pod jobs
    Redis(RedisConfig),
}

/// Shared-store connection settings.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    pub url: String,

    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Logical database index
    pub db: i64,

    pub key_prefix: String,

    /// Expire job keys this long after the last push
    #[serde(with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub job_ttl: Option<Duration>,

    /// Connection attempts before giving up
    pub connect_retries: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            key_prefix: "arena".to_string(),
            job_ttl: None,
            connect_retries: 3,
        }
    }
}

impl RedisConfig {
    /// Expose the password for the connection handshake.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .field("job_ttl", &self.job_ttl)
            .field("connect_retries", &self.connect_retries)
            .finish()
    }
}

/// Aggregator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatorConfig {
    /// Upper bound on each queue read
    #[serde(with = "humantime_serde_duration")]
    pub read_timeout: Duration,

    /// Payload format the job's workers write
    pub output_format: OutputFormat,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            output_format: OutputFormat::Json,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|p| !p.is_empty())
        .map(SecretString::from))
}

mod humantime_serde_duration {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

mod humantime_opt {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArenaConfig::default();
        assert_eq!(config.queue.max_retries, 3);
        assert!(matches!(config.queue.backend, QueueBackendConfig::Memory));
        assert_eq!(config.aggregator.read_timeout, Duration::from_secs(30));
        assert_eq!(config.aggregator.output_format, OutputFormat::Json);
    }

    #[test]
    fn test_parse_redis_yaml() {
        let yaml = r#"
queue:
  maxRetries: 2
  backend:
    type: redis
    url: redis://arena-redis:6379
    password: hunter2
    db: 4
    jobTtl: 24h
aggregator:
  readTimeout: 5s
  outputFormat: junit
"#;
        let config = ArenaConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.queue.max_retries, 2);
        assert_eq!(config.aggregator.read_timeout, Duration::from_secs(5));
        assert_eq!(config.aggregator.output_format, OutputFormat::Junit);

        let QueueBackendConfig::Redis(redis) = &config.queue.backend else {
            panic!("expected redis backend");
        };
        assert_eq!(redis.db, 4);
        assert_eq!(redis.key_prefix, "arena");
        assert_eq!(redis.job_ttl, Some(Duration::from_secs(86_400)));
        assert_eq!(redis.password(), Some("hunter2"));
    }

    #[test]
    fn test_password_never_printed() {
        let config = RedisConfig {
            password: Some(SecretString::from("hunter2".to_string())),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let yaml = "aggregator:\n  readTimeout: 0s\n";
        assert!(matches!(
            ArenaConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_duration_is_a_parse_error() {
        let yaml = "aggregator:\n  readTimeout: soon\n";
        assert!(matches!(
            ArenaConfig::from_yaml(yaml),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"queue": {"maxRetries": 1}}"#;
        let config = ArenaConfig::from_json(json).unwrap();
        assert_eq!(config.queue.max_retries, 1);
        assert!(matches!(config.queue.backend, QueueBackendConfig::Memory));
    }
}
