// # Device Store Trait
//
// Defines the interface for the durable side of device registration and the
// delivery audit log.
//
// ## Purpose
//
// The device store is the source of truth for:
// - Which devices are registered, and for which delivery environment
// - The server-assigned `last_updated` timestamp of each registration
// - The audit trail of every delivery attempt
// - Receipts that clients send back when a notification reaches them
//
// The `DeviceRegistry` keeps an in-memory cache in front of it; the cache is
// derived state and never authoritative.
//
// ## Implementations
//
// - File-based: JSON document with atomic writes (`FileDeviceStore`)
// - In-memory: `MemoryDeviceStore`
//
// ## Usage
//
// ```rust,ignore
// use parkwatch_core::traits::{DeviceRegistration, DeviceStore, Environment};
//
// let store = /* DeviceStore implementation */;
// let confirmed = store
//     .upsert(&DeviceRegistration::new(token, "2.4.0", "iPhone", Environment::Production))
//     .await?;
// assert!(confirmed.last_updated > client_supplied_time);
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::OperationalStatus;

/// Length of a device token in hex characters
pub const DEVICE_TOKEN_LEN: usize = 64;

/// Delivery environment of a device (selects the push channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Sandbox channel (debug builds)
    #[default]
    Development,
    /// Production channel
    Production,
}

impl Environment {
    /// Lowercase name as used on the wire and in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "sandbox" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(crate::Error::invalid_input(format!(
                "Unknown environment: {}",
                other
            ))),
        }
    }
}

/// One registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Opaque 64-character hex token
    pub device_token: String,
    /// Client app version
    #[serde(default)]
    pub app_version: String,
    /// Client device model
    #[serde(default)]
    pub device_type: String,
    /// Delivery environment
    #[serde(default)]
    pub environment: Environment,
    /// Server-assigned timestamp of the last upsert.
    ///
    /// Any value supplied by a client is ignored by [`DeviceStore::upsert`].
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
}

impl DeviceRegistration {
    /// Create a registration request. `last_updated` is left at the epoch
    /// until the store confirms the write.
    pub fn new(
        device_token: impl Into<String>,
        app_version: impl Into<String>,
        device_type: impl Into<String>,
        environment: Environment,
    ) -> Self {
        Self {
            device_token: device_token.into(),
            app_version: app_version.into(),
            device_type: device_type.into(),
            environment,
            last_updated: DateTime::<Utc>::default(),
        }
    }

    /// Validate the token format (exactly 64 hex characters)
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_device_token(&self.device_token)
    }

    /// Abbreviated token for log output
    pub fn short_token(&self) -> &str {
        short_token(&self.device_token)
    }
}

/// Check that a device token is exactly 64 hex characters
pub fn validate_device_token(token: &str) -> Result<(), crate::Error> {
    if token.len() != DEVICE_TOKEN_LEN || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(crate::Error::invalid_input(format!(
            "Device token must be {} hex characters (got {} characters)",
            DEVICE_TOKEN_LEN,
            token.len()
        )));
    }
    Ok(())
}

/// First eight characters of a token; tokens are never logged in full
pub fn short_token(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// Classified result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The channel accepted the notification
    Delivered,
    /// Rate limited, timed out, server error; not retried
    TransientFailure,
    /// The token is dead; the registration was evicted
    PermanentInvalid,
}

/// Immutable audit record of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Store-assigned sequence number (0 until appended)
    #[serde(default)]
    pub id: u64,
    pub device_token: String,
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub park_id: String,
    pub old_status: OperationalStatus,
    pub new_status: OperationalStatus,
    pub old_wait_minutes: u32,
    pub new_wait_minutes: u32,
    pub outcome: DeliveryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// A client's acknowledgement that a notification arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    /// Store-assigned sequence number (0 until appended)
    #[serde(default)]
    pub id: u64,
    pub device_token: String,
    /// When the device says it received the notification
    pub client_time: DateTime<Utc>,
    /// When the receipt reached the server; assigned on record
    #[serde(default)]
    pub server_time: DateTime<Utc>,
    pub entity_id: String,
    #[serde(default)]
    pub park_id: String,
    pub old_status: OperationalStatus,
    pub new_status: OperationalStatus,
    #[serde(default)]
    pub old_wait_time: u32,
    #[serde(default)]
    pub new_wait_time: u32,
}

impl DeliveryReceipt {
    /// Check the fields a receipt cannot be recorded without
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_device_token(&self.device_token)?;
        if self.entity_id.trim().is_empty() {
            return Err(crate::Error::invalid_input("Receipt entity id is required"));
        }
        Ok(())
    }
}

/// Trait for device store implementations
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Ownership
///
/// The store only persists. It does not cache (owned by `DeviceRegistry`),
/// decide evictions (owned by the delivery pool) or validate token format
/// (owned by `DeviceRegistry`).
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert or update a registration keyed by token
    ///
    /// The store assigns `last_updated` from its own clock and returns the
    /// registration exactly as committed.
    ///
    /// # Returns
    ///
    /// - `Ok(DeviceRegistration)`: The committed row
    /// - `Err(Error)`: Storage error (nothing was committed)
    async fn upsert(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<DeviceRegistration, crate::Error>;

    /// Get one registration
    ///
    /// # Returns
    ///
    /// - `Ok(Some(DeviceRegistration))`: Found
    /// - `Ok(None)`: No such token
    /// - `Err(Error)`: Storage error
    async fn get(&self, device_token: &str) -> Result<Option<DeviceRegistration>, crate::Error>;

    /// All registrations, most recently updated first
    async fn get_all(&self) -> Result<Vec<DeviceRegistration>, crate::Error>;

    /// Delete a registration
    ///
    /// Deleting an unknown token is not an error.
    async fn delete(&self, device_token: &str) -> Result<(), crate::Error>;

    /// Delete every registration last updated before `cutoff`
    ///
    /// # Returns
    ///
    /// The tokens that were removed
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, crate::Error>;

    /// Append one delivery audit record
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), crate::Error>;

    /// Most recent audit records, newest first
    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>, crate::Error>;

    /// Append one client delivery receipt
    async fn append_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), crate::Error>;

    /// Most recent receipts, newest first
    async fn recent_receipts(&self, limit: usize) -> Result<Vec<DeliveryReceipt>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}
