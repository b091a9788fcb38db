//! Fan-out of status transitions to delivery jobs
//!
//! Every status transition becomes one [`DeliveryJob`] per registered
//! device. The policy is broadcast: there is no per-device or per-park
//! filter.
//!
//! Wait-time transitions are not pushed; [`log_wait_times`] consumes that
//! topic for operator visibility only.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::Subscription;
use crate::delivery::{DeliveryJob, DeliveryQueue};
use crate::error::Result;
use crate::registry::DeviceRegistry;
use crate::state::{StatusTransition, WaitTimeTransition};

/// Snapshot of fan-out counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutStats {
    pub transitions: u64,
    pub jobs: u64,
    /// Transitions that found no registered device
    pub no_devices: u64,
    /// Transitions dropped because the registry could not be read
    pub registry_failures: u64,
}

#[derive(Debug, Default)]
struct FanOutCounters {
    transitions: AtomicU64,
    jobs: AtomicU64,
    no_devices: AtomicU64,
    registry_failures: AtomicU64,
}

/// Turns status transitions into delivery jobs
pub struct FanOutProcessor {
    registry: Arc<DeviceRegistry>,
    queue: DeliveryQueue,
    counters: Arc<FanOutCounters>,
}

impl FanOutProcessor {
    pub fn new(registry: Arc<DeviceRegistry>, queue: DeliveryQueue) -> Self {
        Self {
            registry,
            queue,
            counters: Arc::new(FanOutCounters::default()),
        }
    }

    /// Enqueue one job per registered device for `transition`
    ///
    /// Waits when the delivery queue is full.
    ///
    /// # Returns
    ///
    /// - `Ok(n)`: `n` jobs enqueued (0 when no device is registered)
    /// - `Err(Error)`: Registry read failed or the queue is closed; the
    ///   transition is not retried
    pub async fn process(&self, transition: &StatusTransition) -> Result<usize> {
        self.counters.transitions.fetch_add(1, Ordering::Relaxed);

        let devices = match self.registry.get_all().await {
            Ok(devices) => devices,
            Err(e) => {
                self.counters
                    .registry_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if devices.is_empty() {
            self.counters.no_devices.fetch_add(1, Ordering::Relaxed);
            debug!(entity_id = %transition.entity_id, "No registered devices, nothing to deliver");
            return Ok(0);
        }

        for device in &devices {
            self.queue
                .submit(DeliveryJob::for_device(transition, device))
                .await?;
            self.counters.jobs.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            entity_id = %transition.entity_id,
            park_id = %transition.park_id,
            old = %transition.old_status,
            new = %transition.new_status,
            jobs = devices.len(),
            "Fanned out status transition"
        );
        Ok(devices.len())
    }

    /// Consume `subscription` until it ends or `shutdown` flips to `true`
    ///
    /// Dropping the processor at the end releases its queue handle, which
    /// lets the delivery pool drain and stop.
    pub async fn run(
        self,
        mut subscription: Subscription<StatusTransition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                transition = subscription.recv() => {
                    let Some(transition) = transition else { break };
                    if let Err(e) = self.process(&transition).await {
                        warn!(
                            entity_id = %transition.entity_id,
                            error = %e,
                            "Dropped status transition"
                        );
                    }
                }
            }
        }
        debug!("Fan-out processor stopped");
    }

    /// A handle that keeps reading counters after the processor is moved
    pub fn stats_handle(&self) -> FanOutStatsHandle {
        FanOutStatsHandle {
            counters: self.counters.clone(),
        }
    }
}

/// Shared read access to fan-out counters
#[derive(Clone)]
pub struct FanOutStatsHandle {
    counters: Arc<FanOutCounters>,
}

impl FanOutStatsHandle {
    pub fn snapshot(&self) -> FanOutStats {
        FanOutStats {
            transitions: self.counters.transitions.load(Ordering::Relaxed),
            jobs: self.counters.jobs.load(Ordering::Relaxed),
            no_devices: self.counters.no_devices.load(Ordering::Relaxed),
            registry_failures: self.counters.registry_failures.load(Ordering::Relaxed),
        }
    }
}

/// Log wait-time transitions until the subscription ends or shutdown
pub async fn log_wait_times(
    mut subscription: Subscription<WaitTimeTransition>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            transition = subscription.recv() => {
                let Some(t) = transition else { break };
                info!(
                    entity_id = %t.entity_id,
                    park_id = %t.park_id,
                    old = t.old_wait_minutes,
                    new = t.new_wait_minutes,
                    "Wait time changed"
                );
            }
        }
    }
}
