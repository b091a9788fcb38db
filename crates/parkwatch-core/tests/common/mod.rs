//! Test doubles and common utilities for contract tests
//!
//! The doubles count calls and let a test script outcomes, but carry no
//! behaviour of their own beyond what the contract under test needs.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parkwatch_core::config::{BackoffConfig, PipelineConfig};
use parkwatch_core::error::{Error, Result};
use parkwatch_core::store::MemoryDeviceStore;
use parkwatch_core::traits::feed_source::{LiveData, QueueData, StandbyQueue};
use parkwatch_core::traits::{
    AuditRecord, DeliveryReceipt, DeviceRegistration, DeviceStore, Environment, FeedConnection, FeedFrame,
    FeedSource, LiveDataEvent, NotificationPayload, NotificationSender, SendOutcome,
};
use parkwatch_core::{Pipeline, PipelineMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};

/// A 64-hex-character token unique per `n`
pub fn token(n: u8) -> String {
    format!("{:02x}", n).repeat(32)
}

pub fn registration(n: u8, environment: Environment) -> DeviceRegistration {
    DeviceRegistration::new(token(n), "2.4.0", "iPhone", environment)
}

/// A decoded `livedata` frame
pub fn livedata(entity_id: &str, status: &str, wait: Option<i64>) -> FeedFrame {
    FeedFrame::Event(LiveDataEvent {
        event: "livedata".to_string(),
        name: format!("Ride {}", entity_id),
        entity_type: "ATTRACTION".to_string(),
        entity_id: entity_id.to_string(),
        park_id: "park-1".to_string(),
        data: LiveData {
            status: status.to_string(),
            queue: QueueData {
                standby: Some(StandbyQueue { wait_time: wait }),
            },
        },
    })
}

/// Pipeline configuration with short backoff and one park
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.feed.park_ids = vec!["park-1".to_string()];
    config.feed.backoff = BackoffConfig {
        initial_ms: 10,
        max_ms: 50,
        multiplier: 2.0,
        jitter: 0.0,
    };
    config.delivery.workers = 2;
    config.delivery.send_timeout_secs = 2;
    config
}

/// Poll pipeline metrics until `done` holds, panicking after five seconds
pub async fn wait_for_metrics<F>(pipeline: &Pipeline, done: F) -> PipelineMetrics
where
    F: Fn(&PipelineMetrics) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let metrics = pipeline.metrics().await;
        if done(&metrics) {
            return metrics;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached, last metrics: {:#?}", metrics);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an arbitrary condition until it holds, panicking after five seconds
pub async fn eventually<F>(what: &str, done: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A DeviceStore that counts calls and can be told to fail
#[derive(Clone)]
pub struct CountingDeviceStore {
    inner: MemoryDeviceStore,
    upsert_calls: Arc<AtomicUsize>,
    get_calls: Arc<AtomicUsize>,
    get_all_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    audit_calls: Arc<AtomicUsize>,
    flush_calls: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    read_delay: Arc<std::sync::Mutex<Duration>>,
    slow_upsert: Arc<std::sync::Mutex<Option<(String, Duration)>>>,
}

impl CountingDeviceStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryDeviceStore::new(),
            upsert_calls: Arc::new(AtomicUsize::new(0)),
            get_calls: Arc::new(AtomicUsize::new(0)),
            get_all_calls: Arc::new(AtomicUsize::new(0)),
            delete_calls: Arc::new(AtomicUsize::new(0)),
            audit_calls: Arc::new(AtomicUsize::new(0)),
            flush_calls: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            read_delay: Arc::new(std::sync::Mutex::new(Duration::ZERO)),
            slow_upsert: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Create a store that shares state and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        other.clone()
    }

    /// Seed a registration directly, bypassing the counters
    pub async fn seed(&self, registration: &DeviceRegistration) -> DeviceRegistration {
        self.inner.upsert(registration).await.unwrap()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Slow down `get` and `get_all` to widen race windows
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    /// Commit upserts carrying `app_version` at once but return them late
    pub fn delay_upsert_return(&self, app_version: &str, delay: Duration) {
        *self.slow_upsert.lock().unwrap() = Some((app_version.to_string(), delay));
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn get_all_calls(&self) -> usize {
        self.get_all_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn audit_calls(&self) -> usize {
        self.audit_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    fn read_check(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::store("read failure injected by test"));
        }
        Ok(())
    }

    /// Applied after the read, so a delayed caller holds a stale result
    async fn pause_after_read(&self) {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn write_check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::store("write failure injected by test"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for CountingDeviceStore {
    async fn upsert(&self, registration: &DeviceRegistration) -> Result<DeviceRegistration> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.write_check()?;
        let confirmed = self.inner.upsert(registration).await;
        let delay = match &*self.slow_upsert.lock().unwrap() {
            Some((version, delay)) if *version == registration.app_version => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        confirmed
    }

    async fn get(&self, device_token: &str) -> Result<Option<DeviceRegistration>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.read_check()?;
        let found = self.inner.get(device_token).await;
        self.pause_after_read().await;
        found
    }

    async fn get_all(&self) -> Result<Vec<DeviceRegistration>> {
        self.get_all_calls.fetch_add(1, Ordering::SeqCst);
        self.read_check()?;
        let devices = self.inner.get_all().await;
        self.pause_after_read().await;
        devices
    }

    async fn delete(&self, device_token: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.write_check()?;
        self.inner.delete(device_token).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.write_check()?;
        self.inner.delete_older_than(cutoff).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.audit_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.append_audit(record).await
    }

    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.inner.recent_audits(limit).await
    }

    async fn append_receipt(&self, receipt: &DeliveryReceipt) -> Result<()> {
        self.write_check()?;
        self.inner.append_receipt(receipt).await
    }

    async fn recent_receipts(&self, limit: usize) -> Result<Vec<DeliveryReceipt>> {
        self.read_check()?;
        self.inner.recent_receipts(limit).await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One recorded send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub device_token: String,
    pub environment: Environment,
    pub payload: NotificationPayload,
}

/// A NotificationSender with per-token scripted outcomes
///
/// Unscripted tokens are delivered. Sends can be held back with
/// [`ScriptedSender::hold`] until [`ScriptedSender::release`]; the gate
/// opens once and stays open.
#[derive(Clone)]
pub struct ScriptedSender {
    outcomes: Arc<std::sync::Mutex<HashMap<String, SendOutcome>>>,
    sent: Arc<std::sync::Mutex<Vec<SentNotification>>>,
    silent: Arc<std::sync::Mutex<Vec<(String, Environment)>>>,
    gate: Arc<Semaphore>,
    held: Arc<AtomicBool>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(std::sync::Mutex::new(HashMap::new())),
            sent: Arc::new(std::sync::Mutex::new(Vec::new())),
            silent: Arc::new(std::sync::Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(0)),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Answer every send to `token` with `outcome`
    pub fn script(&self, token: &str, outcome: SendOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(token.to_string(), outcome);
    }

    /// Block every send until `release`
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let held and future sends through
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.close();
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Content-free sends (token checks), in call order
    pub fn silent_sends(&self) -> Vec<(String, Environment)> {
        self.silent.lock().unwrap().clone()
    }

    fn outcome_for(&self, token: &str) -> SendOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .unwrap_or(SendOutcome::Delivered)
    }

    pub fn sends_to(&self, token: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.device_token == token)
            .count()
    }
}

#[async_trait]
impl NotificationSender for ScriptedSender {
    async fn send(
        &self,
        device_token: &str,
        environment: Environment,
        payload: &NotificationPayload,
    ) -> SendOutcome {
        if self.held.load(Ordering::SeqCst) {
            // Closed gate means released
            let _ = self.gate.acquire().await;
        }
        self.sent.lock().unwrap().push(SentNotification {
            device_token: device_token.to_string(),
            environment,
            payload: payload.clone(),
        });
        self.outcome_for(device_token)
    }

    async fn send_silent(&self, device_token: &str, environment: Environment) -> SendOutcome {
        self.silent
            .lock()
            .unwrap()
            .push((device_token.to_string(), environment));
        self.outcome_for(device_token)
    }

    fn sender_name(&self) -> &'static str {
        "scripted"
    }
}

/// Instructions for a [`ControlledFeed`] connection
#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Hand this frame to the reader
    Frame(FeedFrame),
    /// Remote closes the connection
    Close,
    /// Read error
    Fail,
}

/// A FeedSource driven by the test
///
/// Every connection reads from the same command channel, so frames sent
/// after a reconnect reach the new connection.
#[derive(Clone)]
pub struct ControlledFeed {
    commands: Arc<Mutex<mpsc::UnboundedReceiver<FeedCommand>>>,
    connects: Arc<AtomicUsize>,
    subscriptions: Arc<std::sync::Mutex<Vec<Vec<String>>>>,
    failing_connects: Arc<AtomicUsize>,
    hang_connect: Arc<AtomicBool>,
}

impl ControlledFeed {
    pub fn new() -> (Self, mpsc::UnboundedSender<FeedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            commands: Arc::new(Mutex::new(rx)),
            connects: Arc::new(AtomicUsize::new(0)),
            subscriptions: Arc::new(std::sync::Mutex::new(Vec::new())),
            failing_connects: Arc::new(AtomicUsize::new(0)),
            hang_connect: Arc::new(AtomicBool::new(false)),
        };
        (feed, tx)
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make connection attempts never complete
    pub fn hang_connects(&self) {
        self.hang_connect.store(true, Ordering::SeqCst);
    }

    /// Connection attempts so far (including failed ones)
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for ControlledFeed {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::feed("connection refused (scripted)"));
        }
        Ok(Box::new(ControlledConnection {
            feed: self.clone(),
        }))
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

struct ControlledConnection {
    feed: ControlledFeed,
}

#[async_trait]
impl FeedConnection for ControlledConnection {
    async fn subscribe(&mut self, park_ids: &[String]) -> Result<()> {
        self.feed
            .subscriptions
            .lock()
            .unwrap()
            .push(park_ids.to_vec());
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        let command = self.feed.commands.lock().await.recv().await;
        match command {
            Some(FeedCommand::Frame(frame)) => Ok(Some(frame)),
            Some(FeedCommand::Close) => Ok(None),
            Some(FeedCommand::Fail) => Err(Error::feed("read failure (scripted)")),
            // Test dropped its sender; behave like an idle connection
            None => std::future::pending().await,
        }
    }
}
