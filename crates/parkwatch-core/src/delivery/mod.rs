//! Delivery worker pool
//!
//! A fixed set of workers drains one bounded job queue. Per job a worker:
//!
//! 1. Calls the [`NotificationSender`] for the job's environment, bounded by
//!    the configured send timeout
//! 2. Classifies the result as delivered, transient or permanent
//! 3. On permanent invalidity, deletes the device through the registry
//! 4. Hands an audit record to the audit writer
//!
//! ## Backpressure
//!
//! [`DeliveryQueue::submit`] waits when the queue is full. This is the only
//! stage allowed to push back upstream; jobs are never dropped here.
//!
//! Audit writes go through a separate bounded queue with one writer task.
//! A full audit queue drops the record with a warning so a slow store never
//! stalls delivery.
//!
//! ## Shutdown
//!
//! The job queue closes when the last [`DeliveryQueue`] handle is dropped.
//! Workers finish the jobs already queued and exit; [`DeliveryPool::shutdown`]
//! waits for them up to a grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;
use crate::state::StatusTransition;
use crate::traits::device_store::{AuditRecord, DeviceRegistration, DeviceStore, Environment, short_token};
use crate::traits::notification_sender::{NotificationPayload, NotificationSender, SendOutcome};

/// A request to notify one device of one transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub device_token: String,
    pub environment: Environment,
    pub payload: NotificationPayload,
    pub detected_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Build the job for `device` from a status transition
    pub fn for_device(transition: &StatusTransition, device: &DeviceRegistration) -> Self {
        Self {
            device_token: device.device_token.clone(),
            environment: device.environment,
            payload: NotificationPayload {
                entity_id: transition.entity_id.clone(),
                park_id: transition.park_id.clone(),
                old_status: transition.old_status,
                new_status: transition.new_status,
                old_wait_time: transition.old_wait_minutes,
                new_wait_time: transition.new_wait_minutes,
            },
            detected_at: transition.detected_at,
        }
    }

    fn audit(&self, outcome: &SendOutcome) -> AuditRecord {
        AuditRecord {
            id: 0,
            device_token: self.device_token.clone(),
            timestamp: Utc::now(),
            entity_id: self.payload.entity_id.clone(),
            park_id: self.payload.park_id.clone(),
            old_status: self.payload.old_status,
            new_status: self.payload.new_status,
            old_wait_minutes: self.payload.old_wait_time,
            new_wait_minutes: self.payload.new_wait_time,
            outcome: outcome.kind(),
            failure_reason: outcome.reason().map(str::to_string),
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    enqueued: AtomicU64,
    queued: AtomicI64,
    delivered: AtomicU64,
    transient_failures: AtomicU64,
    permanent_invalid: AtomicU64,
    evicted: AtomicU64,
    eviction_failures: AtomicU64,
    audit_written: AtomicU64,
    audit_dropped: AtomicU64,
    audit_failed: AtomicU64,
}

/// Snapshot of delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub enqueued: u64,
    /// Jobs waiting in the queue right now
    pub queue_depth: u64,
    pub delivered: u64,
    pub transient_failures: u64,
    pub permanent_invalid: u64,
    pub evicted: u64,
    pub eviction_failures: u64,
    pub audit_written: u64,
    pub audit_dropped: u64,
    pub audit_failed: u64,
}

impl DeliveryCounters {
    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            queue_depth: self.queued.load(Ordering::Relaxed).max(0) as u64,
            delivered: self.delivered.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_invalid: self.permanent_invalid.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
            audit_written: self.audit_written.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
            audit_failed: self.audit_failed.load(Ordering::Relaxed),
        }
    }
}

/// Submitting side of the job queue
///
/// Cloneable. The queue closes when every clone is dropped.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<DeliveryJob>,
    counters: Arc<DeliveryCounters>,
}

impl DeliveryQueue {
    /// Enqueue a job, waiting for room if the queue is full
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Queued
    /// - `Err(Error)`: The pool has shut down
    pub async fn submit(&self, job: DeliveryJob) -> Result<()> {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(job).await.is_err() {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Other("Delivery queue closed".to_string()));
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct WorkerContext {
    sender: Arc<dyn NotificationSender>,
    registry: Arc<DeviceRegistry>,
    audit_tx: mpsc::Sender<AuditRecord>,
    counters: Arc<DeliveryCounters>,
    send_timeout: Duration,
}

/// Running worker pool
pub struct DeliveryPool {
    workers: Vec<JoinHandle<()>>,
    audit_writer: JoinHandle<()>,
    counters: Arc<DeliveryCounters>,
}

impl DeliveryPool {
    /// Spawn the workers and the audit writer
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Returns
    ///
    /// The submitting handle and the running pool
    pub fn start(
        sender: Arc<dyn NotificationSender>,
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn DeviceStore>,
        config: &DeliveryConfig,
    ) -> (DeliveryQueue, DeliveryPool) {
        let counters = Arc::new(DeliveryCounters::default());
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (audit_tx, audit_rx) = mpsc::channel(config.audit_queue_capacity.max(1));

        let audit_writer = tokio::spawn(audit_writer(audit_rx, store, counters.clone()));

        let context = Arc::new(WorkerContext {
            sender,
            registry,
            audit_tx,
            counters: counters.clone(),
            send_timeout: config.send_timeout(),
        });
        let jobs = Arc::new(Mutex::new(job_rx));
        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, jobs.clone(), context.clone())))
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Delivery pool started"
        );

        let queue = DeliveryQueue {
            tx: job_tx,
            counters: counters.clone(),
        };
        (
            queue,
            DeliveryPool {
                workers,
                audit_writer,
                counters,
            },
        )
    }

    /// Current counters
    pub fn stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }

    /// A handle that keeps reading counters after the pool is consumed
    pub fn stats_handle(&self) -> DeliveryStatsHandle {
        DeliveryStatsHandle {
            counters: self.counters.clone(),
        }
    }

    /// Wait for workers to drain the closed queue, then for the audit writer
    ///
    /// Workers still busy after `grace` are aborted; their jobs are lost.
    ///
    /// # Returns
    ///
    /// `true` if everything finished within the grace period
    pub async fn shutdown(self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = true;

        for mut worker in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(_) => {}
                Err(_) => {
                    worker.abort();
                    clean = false;
                }
            }
        }

        // Workers are gone, so is every audit sender; the writer drains and exits.
        let mut writer = self.audit_writer;
        if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
            writer.abort();
            clean = false;
        }

        if clean {
            info!("Delivery pool stopped");
        } else {
            warn!("Delivery pool stopped with work still in flight");
        }
        clean
    }
}

/// Shared read access to delivery counters
#[derive(Clone)]
pub struct DeliveryStatsHandle {
    counters: Arc<DeliveryCounters>,
}

impl DeliveryStatsHandle {
    pub fn snapshot(&self) -> DeliveryStats {
        self.counters.snapshot()
    }
}

async fn worker_loop(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    context: Arc<WorkerContext>,
) {
    debug!(worker = id, "Delivery worker started");
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        context.counters.queued.fetch_sub(1, Ordering::Relaxed);
        context.deliver(id, job).await;
    }
    debug!(worker = id, "Delivery worker stopped");
}

impl WorkerContext {
    async fn deliver(&self, worker: usize, job: DeliveryJob) {
        let token = short_token(&job.device_token);
        let outcome = match tokio::time::timeout(
            self.send_timeout,
            self.sender
                .send(&job.device_token, job.environment, &job.payload),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::TransientFailure(format!(
                "Timed out after {}s",
                self.send_timeout.as_secs()
            )),
        };

        match &outcome {
            SendOutcome::Delivered => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker,
                    device_token = %token,
                    environment = %job.environment,
                    entity_id = %job.payload.entity_id,
                    "Notification delivered"
                );
            }
            SendOutcome::TransientFailure(reason) => {
                self.counters
                    .transient_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker,
                    device_token = %token,
                    environment = %job.environment,
                    reason = %reason,
                    "Transient delivery failure, not retrying"
                );
            }
            SendOutcome::PermanentInvalid(reason) => {
                self.counters
                    .permanent_invalid
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker,
                    device_token = %token,
                    reason = %reason,
                    "Device token rejected permanently, evicting"
                );
                match self.registry.delete(&job.device_token).await {
                    Ok(()) => {
                        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters
                            .eviction_failures
                            .fetch_add(1, Ordering::Relaxed);
                        error!(worker, device_token = %token, error = %e, "Failed to evict device");
                    }
                }
            }
        }

        let record = job.audit(&outcome);
        if self.audit_tx.try_send(record).is_err() {
            self.counters.audit_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(worker, device_token = %token, "Audit queue full, dropping audit record");
        }
    }
}

async fn audit_writer(
    mut rx: mpsc::Receiver<AuditRecord>,
    store: Arc<dyn DeviceStore>,
    counters: Arc<DeliveryCounters>,
) {
    while let Some(record) = rx.recv().await {
        write_audit(store.as_ref(), &counters, record).await;
        // Drain whatever else is ready, then persist once.
        while let Ok(record) = rx.try_recv() {
            write_audit(store.as_ref(), &counters, record).await;
        }
        if let Err(e) = store.flush().await {
            warn!(error = %e, "Failed to flush audit records");
        }
    }
    debug!("Audit writer stopped");
}

async fn write_audit(store: &dyn DeviceStore, counters: &DeliveryCounters, record: AuditRecord) {
    match store.append_audit(&record).await {
        Ok(()) => {
            counters.audit_written.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.audit_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                device_token = %short_token(&record.device_token),
                error = %e,
                "Failed to write audit record"
            );
        }
    }
}
