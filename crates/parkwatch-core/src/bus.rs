//! In-process typed publish/subscribe
//!
//! One [`Topic`] per event category. Every subscriber owns a bounded channel;
//! [`Topic::publish`] never waits on any of them. When a subscriber's buffer
//! is full the event is dropped for that subscriber only, a warning is
//! logged and the topic's drop counter is incremented.
//!
//! Subscriptions live for the lifetime of the bus; there is no unsubscribe.
//! A subscriber that drops its receiver is skipped silently from then on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::state::{StatusTransition, WaitTimeTransition};

/// Default per-subscriber buffer
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Event bus with one topic per transition kind
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Topics>,
}

struct Topics {
    status: Topic<StatusTransition>,
    wait_time: Topic<WaitTimeTransition>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Topics {
                status: Topic::new("status", capacity),
                wait_time: Topic::new("wait_time", capacity),
            }),
        }
    }

    /// Status transition topic
    pub fn status(&self) -> &Topic<StatusTransition> {
        &self.inner.status
    }

    /// Wait-time transition topic
    pub fn wait_time(&self) -> &Topic<WaitTimeTransition> {
        &self.inner.wait_time
    }

    /// Counters for both topics
    pub fn stats(&self) -> BusStats {
        BusStats {
            status: self.inner.status.stats(),
            wait_time: self.inner.wait_time.stats(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub status: TopicStats,
    pub wait_time: TopicStats,
}

/// Snapshot of one topic's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub subscribers: usize,
    pub published: u64,
    /// Per-subscriber drops because of a full buffer
    pub dropped: u64,
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

/// A single topic
pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> Topic<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Topic name (for logging)
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a new subscriber with its own bounded buffer
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, tx });
        debug!(topic = self.name, subscriber = id, "New subscriber");
        Subscription { id, rx }
    }

    /// Offer `event` to every subscriber without waiting
    ///
    /// # Returns
    ///
    /// How many subscribers accepted the event
    pub fn publish(&self, event: T) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let mut accepted = 0;

        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        topic = self.name,
                        subscriber = subscriber.id,
                        dropped_total = total,
                        "Subscriber buffer full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        accepted
    }

    /// Events dropped because a subscriber's buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            subscribers: self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiving side of one subscription
///
/// Events arrive in publish order.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Consume the subscription as a `Stream`
    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}
