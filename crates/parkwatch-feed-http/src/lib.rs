// # HTTP Live-Data Feed
//
// This crate provides an HTTP polling feed source for the parkwatch pipeline.
//
// ## Purpose
//
// Polls the park live-data REST endpoint for every subscribed park and hands
// the attractions it finds to the ingestion adapter as `livedata` frames.
//
// ## Architecture
//
// ```text
// connect()      -> PollingConnection (no I/O)
// subscribe(ids) -> remembers the park ids
// next_frame()   -> one poll round per interval:
//                     GET {base}/{parkId}/live?entityType=ATTRACTION
//                     X-API-Key: <key>
//                   then yields a heartbeat followed by one frame per attraction
// ```
//
// A round where every park fails is returned as an error, which makes the
// ingestion adapter disconnect and back off. A round where only some parks
// fail logs the failures and yields what it got.
//
// ## What this crate does NOT do
//
// - Retry or back off (owned by `IngestionAdapter`)
// - Validate statuses or wait times (owned by normalization in core)
// - Spawn background tasks
//
// ## Security
//
// The API key never appears in logs or in `Debug` output.

use async_trait::async_trait;
use parkwatch_core::traits::feed_source::{LiveData, QueueData};
use parkwatch_core::traits::{FeedConnection, FeedFrame, FeedSource, LiveDataEvent};
use parkwatch_core::{Error, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default live-data endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.themeparks.wiki/v1/entity";

/// Default time between poll rounds
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Per-request HTTP timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

const SOURCE_NAME: &str = "http-feed";

/// Body of `GET {base}/{parkId}/live`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveResponse {
    #[serde(default)]
    live_data: Vec<LiveEntry>,
}

/// One element of `liveData[]`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    entity_type: String,
    #[serde(default)]
    park_id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    queue: QueueData,
}

impl LiveEntry {
    fn into_event(self, polled_park: &str) -> LiveDataEvent {
        LiveDataEvent {
            event: "livedata".to_string(),
            name: self.name,
            entity_type: self.entity_type,
            entity_id: self.id,
            park_id: self.park_id.unwrap_or_else(|| polled_park.to_string()),
            data: LiveData {
                status: self.status,
                queue: self.queue,
            },
        }
    }
}

/// Turn a live-data response body into frames, keeping attractions only
fn parse_live_body(body: &str, park_id: &str) -> Result<Vec<LiveDataEvent>> {
    let response: LiveResponse = serde_json::from_str(body)?;
    Ok(response
        .live_data
        .into_iter()
        .filter(|entry| entry.entity_type.eq_ignore_ascii_case("ATTRACTION"))
        .map(|entry| entry.into_event(park_id))
        .collect())
}

fn heartbeat() -> FeedFrame {
    FeedFrame::Event(LiveDataEvent {
        event: "heartbeat".to_string(),
        ..LiveDataEvent::default()
    })
}

struct Inner {
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl Inner {
    async fn fetch_park(&self, park_id: &str) -> Result<Vec<LiveDataEvent>> {
        let url = format!("{}/{}/live", self.base_url, park_id);
        let response = self
            .client
            .get(&url)
            .query(&[("entityType", "ATTRACTION")])
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::transport(SOURCE_NAME, format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => Error::transport(
                    SOURCE_NAME,
                    format!("Authentication failed: check the API key. Status: {}", status),
                ),
                404 => Error::not_found(format!("Park not found: {}", park_id)),
                429 => Error::transport(SOURCE_NAME, "Rate limit exceeded"),
                _ => Error::transport(SOURCE_NAME, format!("HTTP error: {}", status)),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(SOURCE_NAME, format!("Failed to read response: {}", e)))?;
        parse_live_body(&body, park_id)
    }

    /// One pass over every park
    ///
    /// # Returns
    ///
    /// - `Ok(events)`: At least one park answered
    /// - `Err(Error)`: Every park failed (or none are subscribed)
    async fn poll_round(&self, park_ids: &[String]) -> Result<Vec<LiveDataEvent>> {
        if park_ids.is_empty() {
            return Err(Error::feed("No parks subscribed"));
        }

        let mut events = Vec::new();
        let mut failures = 0;
        let mut last_error = None;

        for park_id in park_ids {
            match self.fetch_park(park_id).await {
                Ok(mut park_events) => {
                    tracing::debug!(park_id = %park_id, attractions = park_events.len(), "Polled park");
                    events.append(&mut park_events);
                }
                Err(e) => {
                    tracing::warn!(park_id = %park_id, error = %e, "Failed to poll park");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if failures == park_ids.len() {
            return Err(last_error.unwrap_or_else(|| Error::feed("Every park failed")));
        }
        Ok(events)
    }
}

/// HTTP polling feed source
#[derive(Clone)]
pub struct HttpLiveFeed {
    inner: Arc<Inner>,
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for HttpLiveFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLiveFeed")
            .field("base_url", &self.inner.base_url)
            .field("api_key", &"<REDACTED>")
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

impl HttpLiveFeed {
    /// Create a feed polling `base_url` every 30 seconds
    ///
    /// # Returns
    ///
    /// - `Err(Error::Config)`: Empty API key or base URL
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_poll_interval(base_url, api_key, DEFAULT_POLL_INTERVAL)
    }

    /// Create a feed with a custom poll interval
    pub fn with_poll_interval(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let api_key = api_key.into();

        if base_url.is_empty() {
            return Err(Error::config("Feed base URL cannot be empty"));
        }
        if api_key.is_empty() {
            return Err(Error::config("Feed API key cannot be empty"));
        }
        if poll_interval.is_zero() {
            return Err(Error::config("Feed poll interval must be > 0"));
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                base_url,
                api_key,
                poll_interval,
                client,
            }),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }
}

#[async_trait]
impl FeedSource for HttpLiveFeed {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        tracing::info!(
            base_url = %self.inner.base_url,
            interval_secs = self.inner.poll_interval.as_secs(),
            "Starting live-data polling"
        );
        Ok(Box::new(PollingConnection {
            inner: self.inner.clone(),
            park_ids: Vec::new(),
            pending: VecDeque::new(),
            next_poll: None,
        }))
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }
}

/// One polling session
struct PollingConnection {
    inner: Arc<Inner>,
    park_ids: Vec<String>,
    pending: VecDeque<FeedFrame>,
    /// `None` until the first round, which runs immediately
    next_poll: Option<Instant>,
}

#[async_trait]
impl FeedConnection for PollingConnection {
    async fn subscribe(&mut self, park_ids: &[String]) -> Result<()> {
        if park_ids.is_empty() {
            return Err(Error::config("At least one park id is required"));
        }
        self.park_ids = park_ids.to_vec();
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        if let Some(at) = self.next_poll {
            tokio::time::sleep_until(at).await;
        }
        self.next_poll = Some(Instant::now() + self.inner.poll_interval);

        let events = self.inner.poll_round(&self.park_ids).await?;
        tracing::debug!(attractions = events.len(), "Poll round complete");
        self.pending
            .extend(events.into_iter().map(FeedFrame::Event));

        // Every successful round starts with a heartbeat so an empty round
        // still counts as a live connection.
        Ok(Some(heartbeat()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_core::traits::FeedEventKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const BODY: &str = r#"{
        "id": "park-1",
        "name": "Magic Kingdom",
        "entityType": "PARK",
        "liveData": [
            {
                "id": "ride-1",
                "name": "Space Mountain",
                "entityType": "ATTRACTION",
                "parkId": "park-1",
                "status": "OPERATING",
                "queue": { "STANDBY": { "waitTime": 45 } },
                "lastUpdated": "2024-05-01T12:00:00Z"
            },
            {
                "id": "ride-2",
                "name": "Haunted Mansion",
                "entityType": "ATTRACTION",
                "status": "DOWN",
                "queue": { "STANDBY": { "waitTime": null } }
            },
            {
                "id": "show-1",
                "name": "Fireworks",
                "entityType": "SHOW",
                "status": "OPERATING"
            }
        ]
    }"#;

    /// Serve canned responses, one per accepted connection
    async fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_keeps_attractions_only() {
        let events = parse_live_body(BODY, "park-1").unwrap();
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].entity_id, "ride-1");
        assert_eq!(events[0].kind(), FeedEventKind::LiveData);
        assert_eq!(events[0].data.status, "OPERATING");
        assert_eq!(events[0].standby_wait_time(), Some(45));

        assert_eq!(events[1].park_id, "park-1", "Missing parkId falls back to the polled park");
        assert_eq!(events[1].standby_wait_time(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_live_body("<html>", "park-1").is_err());
        assert!(parse_live_body("{}", "park-1").unwrap().is_empty());
    }

    #[test]
    fn test_new_validates() {
        assert!(HttpLiveFeed::new(DEFAULT_BASE_URL, "").is_err());
        assert!(HttpLiveFeed::new("", "key").is_err());
        assert!(HttpLiveFeed::with_poll_interval(DEFAULT_BASE_URL, "key", Duration::ZERO).is_err());

        let feed = HttpLiveFeed::new(DEFAULT_BASE_URL, "key").unwrap();
        assert_eq!(feed.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(feed.source_name(), "http-feed");
    }

    #[test]
    fn test_api_key_not_exposed_in_debug() {
        let feed = HttpLiveFeed::new(DEFAULT_BASE_URL, "secret_key_12345").unwrap();
        let debug_str = format!("{:?}", feed);
        assert!(!debug_str.contains("secret_key_12345"));
        assert!(debug_str.contains("HttpLiveFeed"));
    }

    #[tokio::test]
    async fn test_poll_round_yields_heartbeat_then_attractions() {
        let base = serve(vec![(200, BODY)]).await;
        let feed = HttpLiveFeed::new(base, "key").unwrap();

        let mut conn = feed.connect().await.unwrap();
        conn.subscribe(&["park-1".to_string()]).await.unwrap();

        let first = conn.next_frame().await.unwrap().unwrap();
        assert!(matches!(first, FeedFrame::Event(ref e) if e.kind() == FeedEventKind::Heartbeat));

        let mut ids = Vec::new();
        for _ in 0..2 {
            match conn.next_frame().await.unwrap().unwrap() {
                FeedFrame::Event(e) => ids.push(e.entity_id),
                FeedFrame::Text(_) => panic!("expected decoded frames"),
            }
        }
        assert_eq!(ids, vec!["ride-1", "ride-2"]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_skipped() {
        let base = serve(vec![(500, "oops"), (200, BODY)]).await;
        let feed = HttpLiveFeed::new(base, "key").unwrap();
        let parks = vec!["broken".to_string(), "park-1".to_string()];

        let events = feed.inner.poll_round(&parks).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error() {
        let base = serve(vec![(401, "{}"), (503, "{}")]).await;
        let feed = HttpLiveFeed::new(base, "key").unwrap();
        let parks = vec!["a".to_string(), "b".to_string()];

        let mut conn = feed.connect().await.unwrap();
        conn.subscribe(&parks).await.unwrap();
        assert!(conn.next_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_requires_parks() {
        let feed = HttpLiveFeed::new(DEFAULT_BASE_URL, "key").unwrap();
        let mut conn = feed.connect().await.unwrap();
        assert!(conn.subscribe(&[]).await.is_err());
    }
}
