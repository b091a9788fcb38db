//! Pipeline wiring
//!
//! The Pipeline owns one instance of every core component and injects them
//! into each other at construction. Nothing is global.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  frames  ┌───────────────────┐  apply  ┌─────────────┐
//! │ FeedSource │─────────▶│ IngestionAdapter  │────────▶│ EntityStore │
//! └────────────┘          └───────────────────┘         └─────────────┘
//!                                                              │ publish
//!                                                              ▼
//!                  ┌──────────────────┐  status  ┌──────────────────────┐
//!                  │ FanOutProcessor  │◀─────────│      EventBus        │
//!                  └──────────────────┘          └──────────────────────┘
//!                     │ get_all   │ submit               │ wait_time
//!                     ▼           ▼                      ▼
//!            ┌────────────────┐ ┌──────────────┐   (logged only)
//!            │ DeviceRegistry │ │ DeliveryPool │──▶ NotificationSender
//!            └────────────────┘ └──────────────┘
//!                     ▲   evict on permanent      │ audit
//!                     └───────────────────────────┤
//!                                                 ▼
//!                                            DeviceStore
//! ```
//!
//! ## Shutdown
//!
//! 1. The done-signal stops ingestion and the bus consumers
//! 2. The fan-out processor drops its queue handle, closing the job queue
//! 3. Workers finish queued jobs (bounded by a grace period)
//! 4. The audit writer drains, then the store is flushed

mod metrics;

pub use metrics::PipelineMetrics;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryPool, DeliveryStats, DeliveryStatsHandle};
use crate::error::{Error, Result};
use crate::fanout::{FanOutProcessor, FanOutStats, FanOutStatsHandle, log_wait_times};
use crate::ingest::{IngestionAdapter, StatusCounts};
use crate::registry::DeviceRegistry;
use crate::state::{Entity, EntityStore};
use crate::traits::device_store::short_token;
use crate::traits::{
    AuditRecord, DeliveryReceipt, DeviceRegistration, DeviceStore, FeedSource, NotificationSender,
    SendOutcome,
};

/// Upper bound on draining queued deliveries at shutdown
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// How often stale devices are pruned, when pruning is enabled
pub const STALE_EVICTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default and maximum number of audit (or receipt) records returned per query
pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1000;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT)
}

struct RunHandles {
    delivery: DeliveryStatsHandle,
    fanout: FanOutStatsHandle,
}

/// The state-diff and notification fan-out pipeline
///
/// ## Lifecycle
///
/// 1. Create with [`Pipeline::new()`]
/// 2. Run with [`Pipeline::run_with_shutdown()`] on a shared handle
/// 3. Use the query and registration methods from any task meanwhile
/// 4. Flip the done-signal to stop
pub struct Pipeline {
    sender: Arc<dyn NotificationSender>,
    store: Arc<dyn DeviceStore>,
    config: PipelineConfig,
    bus: EventBus,
    entities: Arc<EntityStore>,
    registry: Arc<DeviceRegistry>,
    ingestion: IngestionAdapter,
    running: OnceLock<RunHandles>,
}

impl Pipeline {
    /// Create a new pipeline
    ///
    /// # Parameters
    ///
    /// - `source`: Upstream live-data feed
    /// - `sender`: Push notification sender
    /// - `store`: Persistent device store
    /// - `config`: Pipeline configuration
    pub fn new(
        source: Arc<dyn FeedSource>,
        sender: Arc<dyn NotificationSender>,
        store: Arc<dyn DeviceStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.bus.subscriber_capacity);
        let entities = Arc::new(EntityStore::new(bus.clone()));
        let registry = Arc::new(DeviceRegistry::new(store.clone()));
        let ingestion = IngestionAdapter::new(source, entities.clone(), config.feed.clone());

        Ok(Self {
            sender,
            store,
            config,
            bus,
            entities,
            registry,
            ingestion,
            running: OnceLock::new(),
        })
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped)
    ///
    /// May be called once per pipeline.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Already running, or the final store flush failed
    pub async fn run_with_shutdown(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        // Subscribe before anything can publish.
        let status_events = self.bus.status().subscribe();
        let wait_events = self.bus.wait_time().subscribe();

        let (queue, pool) = DeliveryPool::start(
            self.sender.clone(),
            self.registry.clone(),
            self.store.clone(),
            &self.config.delivery,
        );
        let fanout = FanOutProcessor::new(self.registry.clone(), queue);

        let handles = RunHandles {
            delivery: pool.stats_handle(),
            fanout: fanout.stats_handle(),
        };
        if self.running.set(handles).is_err() {
            drop(fanout);
            pool.shutdown(Duration::ZERO).await;
            return Err(Error::Other("Pipeline is already running".to_string()));
        }

        info!(
            sender = self.sender.sender_name(),
            store = self.config.store.type_name(),
            workers = self.config.delivery.workers,
            "Pipeline starting"
        );
        self.registry.warm().await;

        let fanout_task = tokio::spawn(fanout.run(status_events, shutdown.clone()));
        let wait_task = tokio::spawn(log_wait_times(wait_events, shutdown.clone()));
        let eviction_task = self.config.registry.stale_device_max_age().map(|max_age| {
            tokio::spawn(evict_stale_devices(
                self.registry.clone(),
                max_age,
                shutdown.clone(),
            ))
        });

        let ingestion_result = self.ingestion.run(shutdown).await;

        info!("Pipeline stopping");
        for (name, task) in [("fan-out", fanout_task), ("wait-time logger", wait_task)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }
        if let Some(task) = eviction_task {
            if let Err(e) = task.await {
                error!(task = "stale eviction", error = %e, "Task ended abnormally");
            }
        }

        pool.shutdown(DRAIN_GRACE).await;

        self.store.flush().await?;
        info!("Store flushed, pipeline stopped");
        ingestion_result
    }

    /// Snapshot of every known entity
    pub fn entities(&self) -> Vec<Entity> {
        self.entities.all()
    }

    /// One entity
    pub fn entity(&self, entity_id: &str) -> Option<Entity> {
        self.entities.get(entity_id)
    }

    /// Register or refresh a device
    ///
    /// With `registry.verify_on_register` set, a content-free push is sent
    /// first. A token the gateway reports as permanently invalid is rejected
    /// with `Error::InvalidInput` and nothing is written. Transient failures
    /// and timeouts do not block the registration.
    pub async fn register_device(
        &self,
        registration: DeviceRegistration,
    ) -> Result<DeviceRegistration> {
        if self.config.registry.verify_on_register {
            registration.validate()?;
            self.verify_token(&registration).await?;
        }
        self.registry.upsert(registration).await
    }

    async fn verify_token(&self, registration: &DeviceRegistration) -> Result<()> {
        let check = self
            .sender
            .send_silent(&registration.device_token, registration.environment);
        let outcome = tokio::time::timeout(self.config.delivery.send_timeout(), check)
            .await
            .unwrap_or_else(|_| SendOutcome::TransientFailure("Send timed out".to_string()));

        match outcome {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::PermanentInvalid(reason) => {
                warn!(
                    device_token = %short_token(&registration.device_token),
                    environment = %registration.environment,
                    reason = %reason,
                    "Registration rejected by push gateway"
                );
                Err(Error::invalid_input(format!(
                    "Device token rejected by push gateway: {}",
                    reason
                )))
            }
            SendOutcome::TransientFailure(reason) => {
                warn!(
                    device_token = %short_token(&registration.device_token),
                    reason = %reason,
                    "Registration check inconclusive, accepting device"
                );
                Ok(())
            }
        }
    }

    /// Remove a device
    pub async fn deregister_device(&self, device_token: &str) -> Result<()> {
        self.registry.delete(device_token).await
    }

    /// One device
    pub async fn device(&self, device_token: &str) -> Result<Option<DeviceRegistration>> {
        self.registry.get(device_token).await
    }

    /// Every device, most recently updated first
    pub async fn devices(&self) -> Result<Vec<DeviceRegistration>> {
        self.registry.get_all().await
    }

    /// Most recent delivery audit records, newest first
    ///
    /// `limit` defaults to 100 and is clamped to 1..=1000.
    pub async fn recent_audits(&self, limit: Option<usize>) -> Result<Vec<AuditRecord>> {
        self.store.recent_audits(clamp_limit(limit)).await
    }

    /// Record a client's delivery receipt
    ///
    /// Stamps `server_time`; the store assigns the sequence id.
    pub async fn record_receipt(&self, mut receipt: DeliveryReceipt) -> Result<DeliveryReceipt> {
        receipt.validate()?;
        receipt.server_time = chrono::Utc::now();
        self.store.append_receipt(&receipt).await?;

        info!(
            device_token = %short_token(&receipt.device_token),
            entity_id = %receipt.entity_id,
            latency_ms = (receipt.server_time - receipt.client_time).num_milliseconds(),
            "Delivery receipt recorded"
        );
        Ok(receipt)
    }

    /// Most recent delivery receipts, newest first (same limits as audits)
    pub async fn recent_receipts(&self, limit: Option<usize>) -> Result<Vec<DeliveryReceipt>> {
        self.store.recent_receipts(clamp_limit(limit)).await
    }

    /// Current metrics
    pub async fn metrics(&self) -> PipelineMetrics {
        let (delivery, fanout) = match self.running.get() {
            Some(handles) => (handles.delivery.snapshot(), handles.fanout.snapshot()),
            None => (DeliveryStats::default(), FanOutStats::default()),
        };

        PipelineMetrics {
            entities: self.entities.len() as u64,
            entities_by_status: StatusCounts::from_counts(&self.entities.status_counts()),
            devices_cached: self.registry.cached_len().await as u64,
            device_cache_reloads: self.registry.reload_count(),
            bus: self.bus.stats(),
            fanout,
            delivery,
            ingest: self.ingestion.stats(),
        }
    }

    /// The event bus (for additional subscribers)
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The entity store
    pub fn entity_store(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    /// The device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The ingestion adapter
    pub fn ingestion(&self) -> &IngestionAdapter {
        &self.ingestion
    }
}

async fn evict_stale_devices(
    registry: Arc<DeviceRegistry>,
    max_age: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STALE_EVICTION_INTERVAL);
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = registry.evict_stale(max_age).await {
                    warn!(error = %e, "Stale device eviction failed");
                }
            }
        }
    }
}
