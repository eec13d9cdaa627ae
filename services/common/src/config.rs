//! Loader configuration
//!
//! One config source holds a table per loader instance plus process-wide
//! connection settings:
//!
//! ```toml
//! database_url = "postgresql://loader@db/cryptostream"
//! bootstrap_servers = "kafka-1:9092"
//!
//! [upbit_btc]
//! topic_name = "upbit-orderbook-btc"
//! group_name = "upbit-btc-loader"
//! commit_count = 100
//! ```
//!
//! `LOADER_DATABASE_URL` / `LOADER_BOOTSTRAP_SERVERS` override the file, and
//! `DATABASE_URL` is honoured when neither sets a database.

use crate::constants::{
    DEFAULT_BOOTSTRAP_SERVERS, DEFAULT_COOLDOWN_MS, DEFAULT_DATABASE_URL, DEFAULT_MAX_POLL_RECORDS,
    DEFAULT_PARTITION, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_UTC_OFFSET_HOURS, ENV_PREFIX,
    MAX_UTC_OFFSET_HOURS, SECS_PER_HOUR,
};
use crate::errors::ConfigError;
use chrono::FixedOffset;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Immutable per-instance loader configuration
#[derive(Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Instance identifier given at startup
    pub instance: String,
    /// Queue topic to subscribe
    pub topic_name: String,
    /// Consumer group used for checkpointing
    pub group_name: String,
    /// Writes between durable commits
    pub commit_count: usize,
    /// Topic partition consumed by this instance
    pub partition: i32,
    /// Bounded wait of one poll
    pub poll_timeout: Duration,
    /// Pause after any fault
    pub cooldown: Duration,
    /// Cap on messages returned by one poll
    pub max_poll_records: usize,
    /// Venue local date boundary
    pub utc_offset: FixedOffset,
    /// Postgres connection URL
    pub database_url: String,
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
}

// Database URLs may carry credentials
impl fmt::Debug for LoaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderConfig")
            .field("instance", &self.instance)
            .field("topic_name", &self.topic_name)
            .field("group_name", &self.group_name)
            .field("commit_count", &self.commit_count)
            .field("partition", &self.partition)
            .field("poll_timeout", &self.poll_timeout)
            .field("cooldown", &self.cooldown)
            .field("max_poll_records", &self.max_poll_records)
            .field("utc_offset", &self.utc_offset)
            .field("bootstrap_servers", &self.bootstrap_servers)
            .finish_non_exhaustive()
    }
}

/// Raw per-instance section as it appears in the config source
#[derive(Debug, Clone, Deserialize)]
struct InstanceSection {
    topic_name: String,
    group_name: String,
    commit_count: usize,
    #[serde(default = "default_partition")]
    partition: i32,
    #[serde(default = "default_poll_timeout_ms")]
    poll_timeout_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    cooldown_ms: u64,
    #[serde(default = "default_max_poll_records")]
    max_poll_records: usize,
    #[serde(default = "default_utc_offset_hours")]
    utc_offset_hours: i32,
}

const fn default_partition() -> i32 {
    DEFAULT_PARTITION
}

const fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

const fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

const fn default_max_poll_records() -> usize {
    DEFAULT_MAX_POLL_RECORDS
}

const fn default_utc_offset_hours() -> i32 {
    DEFAULT_UTC_OFFSET_HOURS
}

impl LoaderConfig {
    /// Configuration with defaults for everything but the three required options
    pub fn for_instance(
        instance: impl Into<String>,
        topic_name: impl Into<String>,
        group_name: impl Into<String>,
        commit_count: usize,
    ) -> Result<Self, ConfigError> {
        let section = InstanceSection {
            topic_name: topic_name.into(),
            group_name: group_name.into(),
            commit_count,
            partition: DEFAULT_PARTITION,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
        };
        Self::from_section(
            instance.into(),
            section,
            DEFAULT_DATABASE_URL.to_string(),
            DEFAULT_BOOTSTRAP_SERVERS.to_string(),
        )
    }

    /// Load configuration for `instance` from a file plus environment overrides
    pub fn from_file(path: &str, instance: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        Self::from_settings(&settings, instance)
    }

    /// Extract the configuration for `instance` from already-built settings
    pub fn from_settings(settings: &config::Config, instance: &str) -> Result<Self, ConfigError> {
        let section = match settings.get::<InstanceSection>(instance) {
            Ok(section) => section,
            Err(config::ConfigError::NotFound(_)) => settings
                .get::<InstanceSection>(&instance.to_lowercase())
                .map_err(|e| match e {
                    config::ConfigError::NotFound(_) => ConfigError::UnknownInstance {
                        instance: instance.to_string(),
                    },
                    other => ConfigError::Load(other),
                })?,
            Err(e) => return Err(e.into()),
        };

        let database_url = match settings.get_string("database_url") {
            Ok(url) => url,
            Err(_) => std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
        };
        let bootstrap_servers = settings
            .get_string("bootstrap_servers")
            .unwrap_or_else(|_| DEFAULT_BOOTSTRAP_SERVERS.to_string());

        let config = Self::from_section(
            instance.to_string(),
            section,
            database_url,
            bootstrap_servers,
        )?;
        debug!(?config, "Loaded loader configuration");
        Ok(config)
    }

    fn from_section(
        instance: String,
        section: InstanceSection,
        database_url: String,
        bootstrap_servers: String,
    ) -> Result<Self, ConfigError> {
        if section.topic_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "topic_name",
                reason: "must not be empty".to_string(),
            });
        }
        if section.group_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "group_name",
                reason: "must not be empty".to_string(),
            });
        }
        if section.commit_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "commit_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if section.max_poll_records == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_poll_records",
                reason: "must be at least 1".to_string(),
            });
        }
        if section.utc_offset_hours.abs() > MAX_UTC_OFFSET_HOURS {
            return Err(ConfigError::InvalidValue {
                key: "utc_offset_hours",
                reason: format!("{} is outside ±{MAX_UTC_OFFSET_HOURS}", section.utc_offset_hours),
            });
        }
        let utc_offset = FixedOffset::east_opt(section.utc_offset_hours * SECS_PER_HOUR).ok_or(
            ConfigError::InvalidValue {
                key: "utc_offset_hours",
                reason: "not a valid offset".to_string(),
            },
        )?;

        Ok(Self {
            instance,
            topic_name: section.topic_name,
            group_name: section.group_name,
            commit_count: section.commit_count,
            partition: section.partition,
            poll_timeout: Duration::from_millis(section.poll_timeout_ms),
            cooldown: Duration::from_millis(section.cooldown_ms),
            max_poll_records: section.max_poll_records,
            utc_offset,
            database_url,
            bootstrap_servers,
        })
    }
}
