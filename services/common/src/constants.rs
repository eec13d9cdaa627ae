//! Common constants used across all services
//!
//! Single source of truth for loader defaults and storage limits

// Time constants
/// Seconds per hour
pub const SECS_PER_HOUR: i32 = 3600;

// Order book shape
/// Number of depth levels persisted per snapshot
pub const BOOK_DEPTH: usize = 5;
/// Decimal scale of `event_time` (source resolution is milliseconds)
pub const EVENT_TIME_SCALE: u32 = 3;

// Storage limits
/// Exclusive upper bound for level values stored as `NUMERIC(20, 10)`
pub const MAX_LEVEL_INTEGER_DIGITS: u32 = 10;

// Loader defaults
/// Default bounded wait for a queue poll
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 5000;
/// Default pause after any fault
pub const DEFAULT_COOLDOWN_MS: u64 = 5000;
/// Default cap on messages returned by a single poll
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
/// Default topic partition consumed by one instance
pub const DEFAULT_PARTITION: i32 = 0;
/// Venue local date boundary (KST, UTC+9)
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;
/// Widest legal UTC offset
pub const MAX_UTC_OFFSET_HOURS: i32 = 14;
/// Default Postgres URL when neither config nor environment provides one
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/cryptostream";
/// Default Kafka bootstrap servers
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
/// Default config file path
pub const DEFAULT_CONFIG_PATH: &str = "conf/dataloader.toml";
/// Environment prefix for process-wide overrides
pub const ENV_PREFIX: &str = "LOADER";
