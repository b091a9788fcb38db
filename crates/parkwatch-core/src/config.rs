//! Configuration types for the pipeline
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parks the upstream service publishes live data for
pub const DEFAULT_PARK_IDS: [&str; 8] = [
    "bfc89fd6-314d-44b4-b89e-df1a89cf991e",
    "e957da41-3552-4cf6-b636-5babc5cbc4e5",
    "abcfffe7-01f2-4f92-ae61-5093346f5a68",
    "faff60df-c766-4470-8adb-dee78e813f42",
    "6e1464ca-1e9b-49c3-8937-c5c6f6675057",
    "e8d0207f-da8a-4048-bec8-117aa946b2c2",
    "9fc68f1c-3f5e-4f09-89f2-aab2cf1a0741",
    "89db5d43-c434-4097-b71f-f6869f495a22",
];

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Delivery worker pool settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Upstream feed settings
    #[serde(default)]
    pub feed: FeedConfig,

    /// Device store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Registration registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl PipelineConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.bus.subscriber_capacity == 0 {
            return Err(crate::Error::config("Bus subscriber capacity must be > 0"));
        }
        self.delivery.validate()?;
        self.feed.validate()?;
        self.store.validate()?;

        if self.registry.stale_device_max_age_days == Some(0) {
            return Err(crate::Error::config(
                "Stale device max age must be at least 1 day",
            ));
        }

        Ok(())
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Buffered events per subscriber before publishes are dropped for it
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

/// Delivery worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the job queue
    ///
    /// When full, the fan-out processor waits. Jobs are never dropped here.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on a single send (in seconds); elapsing counts as a
    /// transient failure
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Capacity of the audit writer queue
    ///
    /// When full, audit records are dropped with a warning.
    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.workers == 0 {
            return Err(crate::Error::config("Delivery workers must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(crate::Error::config("Delivery queue capacity must be > 0"));
        }
        if self.send_timeout_secs == 0 {
            return Err(crate::Error::config("Delivery send timeout must be > 0"));
        }
        if self.audit_queue_capacity == 0 {
            return Err(crate::Error::config("Audit queue capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            send_timeout_secs: default_send_timeout_secs(),
            audit_queue_capacity: default_audit_queue_capacity(),
        }
    }
}

/// Upstream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Parks to subscribe to
    #[serde(default = "default_park_ids")]
    pub park_ids: Vec<String>,

    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl FeedConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.park_ids.is_empty() {
            return Err(crate::Error::config("No parks configured"));
        }
        if self.park_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(crate::Error::config("Park ids cannot be empty"));
        }
        self.backoff.validate()
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            park_ids: default_park_ids(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential reconnect backoff
///
/// `delay(n) = min(initial * multiplier^(n-1), max) * (1 ± jitter)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay (in milliseconds)
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,

    /// Ceiling before jitter (in milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay randomly added or removed, in [0, 1)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.initial_ms == 0 {
            return Err(crate::Error::config("Backoff initial delay must be > 0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(crate::Error::config(
                "Backoff max delay must be >= initial delay",
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(crate::Error::config("Backoff multiplier must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(crate::Error::config("Backoff jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Device store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// JSON file with atomic writes
    File {
        /// Path to the store file
        path: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,
}

impl StoreConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StoreConfig::File { path } if path.trim().is_empty() => {
                Err(crate::Error::config("Store file path cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Store type name
    pub fn type_name(&self) -> &str {
        match self {
            StoreConfig::File { .. } => "file",
            StoreConfig::Memory => "memory",
        }
    }
}

/// Registration registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Devices not re-registered within this many days are pruned
    /// periodically. Unset disables pruning.
    #[serde(default)]
    pub stale_device_max_age_days: Option<u64>,

    /// Send a content-free push before accepting a registration, rejecting
    /// tokens the gateway reports as permanently invalid
    #[serde(default)]
    pub verify_on_register: bool,
}

impl RegistryConfig {
    pub fn stale_device_max_age(&self) -> Option<chrono::Duration> {
        self.stale_device_max_age_days
            .and_then(|days| i64::try_from(days).ok())
            .map(chrono::Duration::days)
    }
}

fn default_subscriber_capacity() -> usize {
    crate::bus::DEFAULT_SUBSCRIBER_CAPACITY
}

fn default_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    100
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_audit_queue_capacity() -> usize {
    1000
}

fn default_park_ids() -> Vec<String> {
    DEFAULT_PARK_IDS.iter().map(|id| id.to_string()).collect()
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.2
}
