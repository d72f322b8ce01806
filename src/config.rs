//! Client, producer, consumer and embedded broker configuration.
//!
//! Every config type has a `Default` built from [`crate::constants`], a
//! `from_env()` constructor, and a `validate()` that collects every problem
//! instead of stopping at the first.
//!
//! ```rust,no_run
//! use logbridge::config::ConsumerConfig;
//!
//! let config = ConsumerConfig::from_env().expect("invalid environment");
//! if let Err(errors) = config.validate() {
//!     for e in errors {
//!         eprintln!("{}", e);
//!     }
//! }
//! ```

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::compression::CompressionCodec;
use crate::constants::*;
use crate::error::{Error, Result};

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start at the beginning of the log.
    #[default]
    Earliest,
    /// Start at the end of the log, skipping existing records.
    Latest,
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            other => Err(Error::Config(format!("unknown offset reset policy: {}", other))),
        }
    }
}

/// Settings shared by producers and consumers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker addresses, tried in order.
    pub brokers: Vec<String>,
    pub client_id: String,
    /// Producer batching window.
    pub buffering_interval: Duration,
    /// Retries for transient produce failures.
    pub retries: usize,
    /// Enables the connection heartbeat.
    pub keepalive: bool,
    pub compression: CompressionCodec,
    /// Verbose client logging.
    pub debug: bool,
    /// Time allowed for the connection to become ready.
    pub connect_timeout: Duration,
    /// Connection heartbeat cadence.
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKERS.to_string()],
            client_id: DEFAULT_CLIENT_ID.to_string(),
            buffering_interval: DEFAULT_BUFFERING_INTERVAL,
            retries: DEFAULT_RETRIES,
            keepalive: true,
            compression: CompressionCodec::default(),
            debug: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Load client settings from the environment.
    ///
    /// Environment variables:
    /// - `KAFKA_BROKERS`: comma-separated broker addresses (default: 127.0.0.1:9092)
    /// - `KAFKA_CLIENT_ID`: client identifier (default: logbridge)
    /// - `KAFKA_BUFFERING_MS`: producer batching window (default: 100)
    /// - `KAFKA_RETRIES`: produce retry count (default: 3)
    /// - `KAFKA_COMPRESSION`: none, gzip, snappy or lz4 (default: snappy)
    /// - `KAFKA_DEBUG`: verbose logging (default: false)
    /// - `KAFKA_KEEPALIVE`: connection heartbeat (default: true)
    /// - `KAFKA_CONNECT_TIMEOUT_MS`: readiness timeout (default: 10000)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let brokers = match env::var("KAFKA_BROKERS") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.brokers,
        };

        let client_id = env::var("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id);

        let buffering_interval = env_millis("KAFKA_BUFFERING_MS", defaults.buffering_interval)?;
        let retries = env_parse("KAFKA_RETRIES", defaults.retries)?;

        let compression = match env::var("KAFKA_COMPRESSION") {
            Ok(name) => name.parse()?,
            Err(_) => defaults.compression,
        };

        let debug = env_flag("KAFKA_DEBUG", defaults.debug);
        let keepalive = env_flag("KAFKA_KEEPALIVE", defaults.keepalive);
        let connect_timeout = env_millis("KAFKA_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?;

        Ok(Self {
            brokers,
            client_id,
            buffering_interval,
            retries,
            keepalive,
            compression,
            debug,
            connect_timeout,
            heartbeat_interval: defaults.heartbeat_interval,
        })
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.brokers.is_empty() {
            errors.push("brokers must contain at least one address".to_string());
        }
        for broker in &self.brokers {
            if !broker.contains(':') {
                errors.push(format!("broker address '{}' must be host:port", broker));
            }
        }
        if self.client_id.trim().is_empty() {
            errors.push("client_id must not be empty".to_string());
        }
        if self.buffering_interval.is_zero() {
            errors.push("buffering_interval must be greater than zero".to_string());
        }
        if self.connect_timeout.is_zero() {
            errors.push("connect_timeout must be greater than zero".to_string());
        }
        if self.keepalive && self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than zero".to_string());
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client: ClientConfig,
    /// Cadence of delivery report polling.
    pub poll_interval: Duration,
    /// Maximum records held in the client-side buffer.
    pub queue_buffering_max_messages: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_buffering_max_messages: DEFAULT_QUEUE_BUFFERING_MAX_MESSAGES,
        }
    }
}

impl ProducerConfig {
    /// Load producer settings from the environment.
    ///
    /// Reads the [`ClientConfig`] variables plus `POLL_INTERVAL_MS`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            client: ClientConfig::from_env()?,
            poll_interval: env_millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            queue_buffering_max_messages: defaults.queue_buffering_max_messages,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.collect_errors(&mut errors);
        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than zero".to_string());
        }
        if self.queue_buffering_max_messages == 0 {
            errors.push("queue_buffering_max_messages must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub client: ClientConfig,
    /// Consumer group id.
    pub group_id: String,
    /// Cadence of the poll loop.
    pub poll_interval: Duration,
    /// Maximum records per poll cycle.
    pub batch_size: usize,
    /// Must stay false; offsets are committed explicitly after processing.
    pub enable_auto_commit: bool,
    /// Must stay false; offsets are stored only by explicit commits.
    pub enable_auto_offset_store: bool,
    /// Group session timeout.
    pub session_timeout: Duration,
    /// Cadence of the group heartbeat.
    pub group_heartbeat_interval: Duration,
    /// Start position when the group has no committed offset.
    pub offset_reset: OffsetReset,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_POLL_BATCH_SIZE,
            enable_auto_commit: false,
            enable_auto_offset_store: false,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            group_heartbeat_interval: DEFAULT_GROUP_HEARTBEAT_INTERVAL,
            offset_reset: OffsetReset::default(),
        }
    }
}

impl ConsumerConfig {
    /// Load consumer settings from the environment.
    ///
    /// Reads the [`ClientConfig`] variables plus:
    /// - `CONSUMER_GROUP`: group id (default: contribution-group)
    /// - `POLL_INTERVAL_MS`: poll cadence (default: 1000)
    /// - `POLL_BATCH_SIZE`: records per poll cycle (default: 100)
    /// - `AUTO_OFFSET_RESET`: earliest or latest (default: earliest)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let offset_reset = match env::var("AUTO_OFFSET_RESET") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.offset_reset,
        };

        Ok(Self {
            client: ClientConfig::from_env()?,
            group_id: env::var("CONSUMER_GROUP").unwrap_or(defaults.group_id),
            poll_interval: env_millis("POLL_INTERVAL_MS", defaults.poll_interval)?,
            batch_size: env_parse("POLL_BATCH_SIZE", defaults.batch_size)?,
            offset_reset,
            ..defaults
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.collect_errors(&mut errors);

        if self.group_id.trim().is_empty() {
            errors.push("group_id must not be empty".to_string());
        }
        if self.enable_auto_commit {
            errors.push("enable_auto_commit must be false; commits are manual".to_string());
        }
        if self.enable_auto_offset_store {
            errors.push("enable_auto_offset_store must be false; offsets are stored on commit".to_string());
        }
        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than zero".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be at least 1".to_string());
        }
        if self.group_heartbeat_interval >= self.session_timeout {
            errors.push(format!(
                "group_heartbeat_interval ({:?}) must be less than session_timeout ({:?})",
                self.group_heartbeat_interval, self.session_timeout
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Embedded broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Create unknown topics on first use.
    pub auto_create_topics: bool,
    /// Partition count of auto-created topics.
    pub default_partitions: i32,
    /// Largest accepted record value.
    pub max_message_bytes: usize,
    /// Records retained per partition; `None` keeps everything.
    pub retention_max_records: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auto_create_topics: true,
            default_partitions: DEFAULT_TOPIC_PARTITIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            retention_max_records: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.default_partitions < 1 {
            errors.push(format!(
                "default_partitions ({}) must be at least 1",
                self.default_partitions
            ));
        }
        if self.max_message_bytes < 1024 {
            errors.push(format!(
                "max_message_bytes ({}) should be at least 1KB",
                self.max_message_bytes
            ));
        }
        if self.retention_max_records == Some(0) {
            errors.push("retention_max_records must be at least 1 when set".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let millis = env_parse(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ProducerConfig::default().validate().is_ok());
        assert!(ConsumerConfig::default().validate().is_ok());
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.group_id, "contribution-group");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.offset_reset, OffsetReset::Earliest);
        assert!(!config.enable_auto_commit);
    }

    #[test]
    fn test_auto_commit_rejected() {
        let config = ConsumerConfig {
            enable_auto_commit: true,
            enable_auto_offset_store: true,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("enable_auto_commit"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ConsumerConfig {
            client: ClientConfig {
                brokers: vec![],
                client_id: " ".into(),
                ..Default::default()
            },
            group_id: String::new(),
            batch_size: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_session() {
        let config = ConsumerConfig {
            session_timeout: Duration::from_secs(1),
            group_heartbeat_interval: Duration::from_secs(2),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("session_timeout"));
    }

    #[test]
    fn test_broker_address_format() {
        let config = ClientConfig {
            brokers: vec!["localhost".into()],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err()[0].contains("host:port"));
    }

    #[test]
    fn test_offset_reset_parse() {
        assert_eq!("LATEST".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert_eq!("smallest".parse::<OffsetReset>().unwrap(), OffsetReset::Earliest);
        assert!("middle".parse::<OffsetReset>().is_err());
    }

    #[test]
    fn test_broker_config_validation() {
        let config = BrokerConfig {
            default_partitions: 0,
            max_message_bytes: 10,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().len(), 2);
    }
}
