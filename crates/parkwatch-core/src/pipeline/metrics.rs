//! Typed metrics snapshot

use serde::Serialize;

use crate::bus::BusStats;
use crate::delivery::DeliveryStats;
use crate::fanout::FanOutStats;
use crate::ingest::{IngestStats, StatusCounts};
use crate::state::OperationalStatus;
use std::collections::HashMap;

/// Point-in-time view of every pipeline counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    pub entities: u64,
    pub entities_by_status: StatusCounts,
    pub devices_cached: u64,
    pub device_cache_reloads: u64,
    pub bus: BusStats,
    pub fanout: FanOutStats,
    pub delivery: DeliveryStats,
    pub ingest: IngestStats,
}

impl StatusCounts {
    pub(crate) fn from_counts(counts: &HashMap<OperationalStatus, usize>) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0) as u64;
        Self {
            operating: get(OperationalStatus::Operating),
            down: get(OperationalStatus::Down),
            closed: get(OperationalStatus::Closed),
            refurbishment: get(OperationalStatus::Refurbishment),
        }
    }

    /// Sum across statuses
    pub fn total(&self) -> u64 {
        self.operating + self.down + self.closed + self.refurbishment
    }
}
