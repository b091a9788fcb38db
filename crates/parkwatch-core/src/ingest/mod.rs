//! Ingestion adapter
//!
//! Drives a [`FeedSource`] through an explicit connection lifecycle and
//! turns raw frames into [`EntityStore::apply`] calls.
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Disconnected ──backoff──▶ Connecting ──▶ Subscribed ──first frame──▶ Reading
//!        ▲                        │              │                          │
//!        └────────────────────────┴──────────────┴──── error / remote close ┘
//! ```
//!
//! The backoff delay grows exponentially with jitter and resets once a
//! connection reaches `Reading`. A shutdown signal interrupts connecting,
//! backoff sleeps and reads alike.
//!
//! ## Normalization
//!
//! Only `livedata` frames reach the store. A frame is rejected (and counted
//! as malformed) when its text does not decode, its entity id is empty, its
//! status is unknown, or its wait time is negative. A null wait time is 0.

pub mod backoff;

pub use backoff::Backoff;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::state::{EntityStore, EntityUpdate, OperationalStatus, Transition};
use crate::traits::feed_source::{FeedEventKind, FeedFrame, FeedSource, LiveDataEvent};

/// Connection timestamps retained for diagnostics
pub const CONNECTION_HISTORY: usize = 100;

/// Where the adapter is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Reading,
}

/// Validate a `livedata` frame into an entity update
pub fn normalize(event: &LiveDataEvent) -> Result<EntityUpdate> {
    let entity_id = event.entity_id.trim();
    if entity_id.is_empty() {
        return Err(Error::invalid_input("Live data frame without entity id"));
    }

    let status: OperationalStatus = event.data.status.parse()?;

    let wait_minutes = match event.standby_wait_time() {
        None => 0,
        Some(wait) => u32::try_from(wait).map_err(|_| {
            Error::invalid_input(format!(
                "Invalid wait time {} for entity {}",
                wait, entity_id
            ))
        })?,
    };

    Ok(EntityUpdate {
        entity_id: entity_id.to_string(),
        name: event.name.clone(),
        category: event.entity_type.clone(),
        park_id: event.park_id.clone(),
        status,
        wait_minutes,
    })
}

#[derive(Debug, Default)]
struct IngestCounters {
    livedata: AtomicU64,
    heartbeats: AtomicU64,
    error_frames: AtomicU64,
    other_frames: AtomicU64,
    malformed: AtomicU64,
    transitions: AtomicU64,
    operating: AtomicU64,
    down: AtomicU64,
    closed: AtomicU64,
    refurbishment: AtomicU64,
    connects: AtomicU64,
    connection_errors: AtomicU64,
    recent_connections: Mutex<VecDeque<DateTime<Utc>>>,
}

impl IngestCounters {
    fn count_status(&self, status: OperationalStatus) {
        let counter = match status {
            OperationalStatus::Operating => &self.operating,
            OperationalStatus::Down => &self.down,
            OperationalStatus::Closed => &self.closed,
            OperationalStatus::Refurbishment => &self.refurbishment,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let mut recent = self
            .recent_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        recent.push_back(Utc::now());
        while recent.len() > CONNECTION_HISTORY {
            recent.pop_front();
        }
    }
}

/// Observed statuses across all accepted `livedata` frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub operating: u64,
    pub down: u64,
    pub closed: u64,
    pub refurbishment: u64,
}

/// Snapshot of ingestion statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub state: ConnectionState,
    pub livedata: u64,
    pub heartbeats: u64,
    pub error_frames: u64,
    pub other_frames: u64,
    pub malformed: u64,
    pub transitions: u64,
    pub statuses: StatusCounts,
    pub connects: u64,
    pub connection_errors: u64,
    /// Most recent successful connections, oldest first
    pub recent_connections: Vec<DateTime<Utc>>,
}

/// Outcome of one connection attempt cycle
enum Cycle {
    /// Connection ended; `reached_reading` tells whether any frame arrived
    Ended { reached_reading: bool },
    Shutdown,
}

/// Feed ingestion with reconnect and normalization
pub struct IngestionAdapter {
    source: Arc<dyn FeedSource>,
    store: Arc<EntityStore>,
    config: FeedConfig,
    counters: Arc<IngestCounters>,
    state: watch::Sender<ConnectionState>,
}

impl IngestionAdapter {
    pub fn new(source: Arc<dyn FeedSource>, store: Arc<EntityStore>, config: FeedConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            store,
            config,
            counters: Arc::new(IngestCounters::default()),
            state,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect, read and reconnect until `shutdown` becomes `true` or its
    /// sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        info!(
            source = self.source.source_name(),
            parks = self.config.park_ids.len(),
            "Ingestion started"
        );

        while !*shutdown.borrow() {
            match self.cycle(&mut shutdown).await {
                Cycle::Shutdown => break,
                Cycle::Ended { reached_reading } => {
                    self.set_state(ConnectionState::Disconnected);
                    if reached_reading {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    debug!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Ingestion stopped");
        Ok(())
    }

    /// One pass through Connecting -> Subscribed -> Reading
    async fn cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Cycle {
        self.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = shutdown_requested(shutdown) => return Cycle::Shutdown,
            connected = self.source.connect() => connected,
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                self.counters
                    .connection_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(source = self.source.source_name(), error = %e, "Feed connection failed");
                return Cycle::Ended {
                    reached_reading: false,
                };
            }
        };
        self.counters.record_connect();

        let subscribed = tokio::select! {
            _ = shutdown_requested(shutdown) => return Cycle::Shutdown,
            subscribed = connection.subscribe(&self.config.park_ids) => subscribed,
        };
        if let Err(e) = subscribed {
            self.counters
                .connection_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Feed subscription failed");
            return Cycle::Ended {
                reached_reading: false,
            };
        }
        self.set_state(ConnectionState::Subscribed);
        info!(parks = self.config.park_ids.len(), "Subscribed to live data");

        let mut reached_reading = false;
        loop {
            let frame = tokio::select! {
                _ = shutdown_requested(shutdown) => return Cycle::Shutdown,
                frame = connection.next_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if !reached_reading {
                        reached_reading = true;
                        self.set_state(ConnectionState::Reading);
                    }
                    self.handle_frame(frame);
                }
                Ok(None) => {
                    info!("Feed closed by remote");
                    return Cycle::Ended { reached_reading };
                }
                Err(e) => {
                    self.counters
                        .connection_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Feed read failed");
                    return Cycle::Ended { reached_reading };
                }
            }
        }
    }

    /// Classify, normalize and apply one frame
    ///
    /// # Returns
    ///
    /// The transitions the frame produced (empty for anything that is not an
    /// accepted `livedata` frame)
    pub fn handle_frame(&self, frame: FeedFrame) -> Vec<Transition> {
        let event = match frame {
            FeedFrame::Event(event) => event,
            FeedFrame::Text(text) => match LiveDataEvent::decode(&text) {
                Ok(event) => event,
                Err(e) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Undecodable feed frame");
                    return Vec::new();
                }
            },
        };

        match event.kind() {
            FeedEventKind::Heartbeat => {
                self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
            FeedEventKind::Error => {
                self.counters.error_frames.fetch_add(1, Ordering::Relaxed);
                warn!(
                    entity_id = %event.entity_id,
                    park_id = %event.park_id,
                    name = %event.name,
                    "Feed reported an error"
                );
                Vec::new()
            }
            FeedEventKind::Other => {
                self.counters.other_frames.fetch_add(1, Ordering::Relaxed);
                debug!(event = %event.event, "Ignoring feed frame");
                Vec::new()
            }
            FeedEventKind::LiveData => {
                self.counters.livedata.fetch_add(1, Ordering::Relaxed);
                match normalize(&event) {
                    Ok(update) => {
                        self.counters.count_status(update.status);
                        let transitions = self.store.apply(update);
                        self.counters
                            .transitions
                            .fetch_add(transitions.len() as u64, Ordering::Relaxed);
                        transitions
                    }
                    Err(e) => {
                        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        debug!(entity_id = %event.entity_id, error = %e, "Rejected live data frame");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Current statistics
    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            state: self.state(),
            livedata: c.livedata.load(Ordering::Relaxed),
            heartbeats: c.heartbeats.load(Ordering::Relaxed),
            error_frames: c.error_frames.load(Ordering::Relaxed),
            other_frames: c.other_frames.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            transitions: c.transitions.load(Ordering::Relaxed),
            statuses: StatusCounts {
                operating: c.operating.load(Ordering::Relaxed),
                down: c.down.load(Ordering::Relaxed),
                closed: c.closed.load(Ordering::Relaxed),
                refurbishment: c.refurbishment.load(Ordering::Relaxed),
            },
            connects: c.connects.load(Ordering::Relaxed),
            connection_errors: c.connection_errors.load(Ordering::Relaxed),
            recent_connections: c
                .recent_connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }
}

/// Resolves once shutdown is requested or the signal's sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
