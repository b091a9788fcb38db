// # Feed Source Trait
//
// Defines the interface for the upstream live-data feed.
//
// ## Purpose
//
// A feed source knows how to open a connection; a connection knows how to
// subscribe to parks and hand back raw frames. Everything else (parsing
// into entity updates, validation, reconnect and backoff) is owned by the
// `IngestionAdapter`.
//
// ## Implementations
//
// - HTTP polling: `parkwatch-feed-http` crate
//
// ## Usage
//
// ```rust,ignore
// let mut conn = source.connect().await?;
// conn.subscribe(&park_ids).await?;
// while let Some(frame) = conn.next_frame().await? {
//     adapter.handle_frame(frame);
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One raw live-data frame as the upstream service shapes it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDataEvent {
    /// Frame kind: `livedata`, `heartbeat`, `error`, ...
    pub event: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub park_id: String,
    #[serde(default)]
    pub data: LiveData,
}

/// Payload of a `livedata` frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveData {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub queue: QueueData,
}

/// Queue section of a `livedata` frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueData {
    #[serde(rename = "STANDBY", default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<StandbyQueue>,
}

/// Standby queue; the wait time is null when the attraction publishes none
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandbyQueue {
    #[serde(default)]
    pub wait_time: Option<i64>,
}

/// Frame classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    LiveData,
    Heartbeat,
    Error,
    Other,
}

impl LiveDataEvent {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, crate::Error> {
        Ok(serde_json::from_str(text)?)
    }

    /// Classify the frame by its `event` field
    pub fn kind(&self) -> FeedEventKind {
        match self.event.as_str() {
            "livedata" => FeedEventKind::LiveData,
            "heartbeat" => FeedEventKind::Heartbeat,
            "error" => FeedEventKind::Error,
            _ => FeedEventKind::Other,
        }
    }

    /// Standby wait time as published (may be null or negative)
    pub fn standby_wait_time(&self) -> Option<i64> {
        self.data.queue.standby.as_ref().and_then(|q| q.wait_time)
    }
}

/// A frame handed to the ingestion adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Undecoded text frame (socket-style transports)
    Text(String),
    /// Already-decoded frame (transports that parse their own responses)
    Event(LiveDataEvent),
}

/// Trait for feed source implementations
///
/// # Trust Level: Semi-Trusted
///
/// - ✅ Perform network I/O to the upstream service
/// - ❌ Retry or sleep between connection attempts (owned by `IngestionAdapter`)
/// - ❌ Touch entity state (owned by `EntityStore`)
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Open a new connection
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn FeedConnection>)`: Connected, not yet subscribed
    /// - `Err(Error)`: Connection failed (the adapter will back off)
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, crate::Error>;

    /// Source name (for logging)
    fn source_name(&self) -> &'static str;
}

/// An open feed connection
#[async_trait]
pub trait FeedConnection: Send {
    /// Subscribe to live data for the given parks
    async fn subscribe(&mut self, park_ids: &[String]) -> Result<(), crate::Error>;

    /// Wait for the next frame
    ///
    /// # Returns
    ///
    /// - `Ok(Some(frame))`: A frame
    /// - `Ok(None)`: The remote side closed the connection
    /// - `Err(Error)`: Read failure
    async fn next_frame(&mut self) -> Result<Option<FeedFrame>, crate::Error>;
}
