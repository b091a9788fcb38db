// # Entity State
//
// Authoritative in-memory state of every monitored attraction, plus the
// transition facts produced when that state changes.
//
// ## Ownership
//
// `EntityStore` is the only writer of `Entity` values. Everything else
// receives clones (snapshots) or transition events from the `EventBus`.

pub mod entity_store;

pub use entity_store::EntityStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational status of an attraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalStatus {
    Closed,
    Operating,
    Down,
    Refurbishment,
}

impl OperationalStatus {
    /// All statuses, in display order
    pub const ALL: [OperationalStatus; 4] = [
        OperationalStatus::Operating,
        OperationalStatus::Down,
        OperationalStatus::Closed,
        OperationalStatus::Refurbishment,
    ];

    /// Upstream wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Closed => "CLOSED",
            OperationalStatus::Operating => "OPERATING",
            OperationalStatus::Down => "DOWN",
            OperationalStatus::Refurbishment => "REFURBISHMENT",
        }
    }
}

impl std::fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationalStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLOSED" => Ok(OperationalStatus::Closed),
            "OPERATING" => Ok(OperationalStatus::Operating),
            "DOWN" => Ok(OperationalStatus::Down),
            "REFURBISHMENT" => Ok(OperationalStatus::Refurbishment),
            other => Err(crate::Error::invalid_input(format!(
                "Unknown operational status: {:?}",
                other
            ))),
        }
    }
}

/// One monitored attraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub category: String,
    pub park_id: String,
    pub status: OperationalStatus,
    /// Standby wait in minutes; 0 means no wait or unknown
    pub wait_minutes: u32,
    pub status_changed_at: DateTime<Utc>,
    pub wait_changed_at: DateTime<Utc>,
}

/// A validated, proposed new state for one entity
///
/// Built by the ingestion adapter after normalization; the store never sees
/// malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpdate {
    pub entity_id: String,
    pub name: String,
    pub category: String,
    pub park_id: String,
    pub status: OperationalStatus,
    pub wait_minutes: u32,
}

impl EntityUpdate {
    pub fn new(
        entity_id: impl Into<String>,
        park_id: impl Into<String>,
        status: OperationalStatus,
        wait_minutes: u32,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: String::new(),
            category: String::new(),
            park_id: park_id.into(),
            status,
            wait_minutes,
        }
    }

    /// Set the descriptive fields
    pub fn with_details(mut self, name: impl Into<String>, category: impl Into<String>) -> Self {
        self.name = name.into();
        self.category = category.into();
        self
    }
}

/// Detected change of an entity's operational status
///
/// Carries the wait values from the same observation so a notification can
/// show both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub entity_id: String,
    pub park_id: String,
    pub old_status: OperationalStatus,
    pub new_status: OperationalStatus,
    pub old_wait_minutes: u32,
    pub new_wait_minutes: u32,
    pub detected_at: DateTime<Utc>,
}

/// Detected change of an entity's standby wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitTimeTransition {
    pub entity_id: String,
    pub park_id: String,
    pub old_wait_minutes: u32,
    pub new_wait_minutes: u32,
    pub detected_at: DateTime<Utc>,
}

/// Any transition produced by a single `apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Status(StatusTransition),
    WaitTime(WaitTimeTransition),
}
