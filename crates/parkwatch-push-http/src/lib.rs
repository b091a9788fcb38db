// # HTTP Push Sender
//
// This crate provides an HTTP push-gateway notification sender for the
// parkwatch pipeline.
//
// ## Implementation
//
// - One `POST {endpoint}/3/device/{token}` per call, to the development or
//   production endpoint depending on the device's environment
// - Bearer authentication, optional topic header
// - Silent background push: `aps.content-available = 1`, `aps.badge = 1`,
//   plus the transition fields at the top level
// - Registration checks (`send_silent`) carry only
//   `{"aps":{"content-available":1}}`
// - Every result is classified into a `SendOutcome`; nothing is returned as
//   an error
//
// ## Outcome classification
//
// | Response                          | Outcome            |
// |-----------------------------------|--------------------|
// | 2xx                               | Delivered          |
// | 400 `BadDeviceToken`              | PermanentInvalid   |
// | 410 (`Unregistered`)              | PermanentInvalid   |
// | 429, 5xx, timeout, connect error  | TransientFailure   |
// | anything else                     | TransientFailure   |
//
// Configuration problems (403, 400 with another reason) are never blamed on
// the device, so they stay transient.
//
// ## Security
//
// - The auth token NEVER appears in logs or in `Debug` output
// - Device tokens are logged abbreviated

use async_trait::async_trait;
use parkwatch_core::traits::device_store::short_token;
use parkwatch_core::traits::{Environment, NotificationPayload, NotificationSender, SendOutcome};
use parkwatch_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default development (sandbox) endpoint
pub const DEFAULT_DEVELOPMENT_URL: &str = "https://api.sandbox.push.apple.com";

/// Default production endpoint
pub const DEFAULT_PRODUCTION_URL: &str = "https://api.push.apple.com";

/// Default HTTP timeout for a single push
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reasons that mean the token will never be valid again
const BAD_DEVICE_TOKEN: &str = "BadDeviceToken";
const UNREGISTERED: &str = "Unregistered";

#[derive(Debug, Serialize)]
struct Aps {
    #[serde(rename = "content-available")]
    content_available: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
}

#[derive(Debug, Serialize)]
struct PushBody<'a> {
    aps: Aps,
    #[serde(flatten)]
    payload: &'a NotificationPayload,
}

impl<'a> PushBody<'a> {
    fn silent(payload: &'a NotificationPayload) -> Self {
        Self {
            aps: Aps {
                content_available: 1,
                badge: Some(1),
            },
            payload,
        }
    }
}

/// Body of a registration check push: no transition, no badge
#[derive(Debug, Serialize)]
struct CheckBody {
    aps: Aps,
}

impl CheckBody {
    fn new() -> Self {
        Self {
            aps: Aps {
                content_available: 1,
                badge: None,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    reason: Option<String>,
}

/// Map a gateway response onto a delivery outcome
pub fn classify(status: u16, reason: Option<&str>) -> SendOutcome {
    let described = || match reason {
        Some(reason) => format!("{} {}", status, reason),
        None => status.to_string(),
    };

    match status {
        200..=299 => SendOutcome::Delivered,
        400 if reason == Some(BAD_DEVICE_TOKEN) => SendOutcome::PermanentInvalid(BAD_DEVICE_TOKEN.to_string()),
        410 => SendOutcome::PermanentInvalid(reason.unwrap_or(UNREGISTERED).to_string()),
        429 => SendOutcome::TransientFailure(format!("Rate limited ({})", described())),
        500..=599 => SendOutcome::TransientFailure(format!("Gateway error ({})", described())),
        _ => SendOutcome::TransientFailure(format!("Rejected ({})", described())),
    }
}

/// HTTP push-gateway sender
pub struct HttpPushSender {
    development_url: String,
    production_url: String,

    /// Bearer token for the gateway
    /// ⚠️ NEVER log this value
    auth_token: String,

    /// Topic header (app bundle id), if the gateway needs one
    topic: Option<String>,

    client: reqwest::Client,
}

// Custom Debug implementation that hides the auth token
impl std::fmt::Debug for HttpPushSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPushSender")
            .field("development_url", &self.development_url)
            .field("production_url", &self.production_url)
            .field("auth_token", &"<REDACTED>")
            .field("topic", &self.topic)
            .finish()
    }
}

impl HttpPushSender {
    /// Create a sender
    ///
    /// # Parameters
    ///
    /// - `development_url`: Endpoint for `Environment::Development` devices
    /// - `production_url`: Endpoint for `Environment::Production` devices
    /// - `auth_token`: Bearer token
    /// - `topic`: Optional topic header value
    ///
    /// # Returns
    ///
    /// - `Err(Error::Config)`: Empty token or endpoint
    pub fn new(
        development_url: impl Into<String>,
        production_url: impl Into<String>,
        auth_token: impl Into<String>,
        topic: Option<String>,
    ) -> Result<Self> {
        let development_url = development_url.into().trim_end_matches('/').to_string();
        let production_url = production_url.into().trim_end_matches('/').to_string();
        let auth_token = auth_token.into();

        if auth_token.is_empty() {
            return Err(Error::config("Push auth token cannot be empty"));
        }
        if development_url.is_empty() || production_url.is_empty() {
            return Err(Error::config("Push endpoints cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            development_url,
            production_url,
            auth_token,
            topic: topic.filter(|t| !t.is_empty()),
            client,
        })
    }

    /// Endpoint base for `environment`
    pub fn endpoint(&self, environment: Environment) -> &str {
        match environment {
            Environment::Development => &self.development_url,
            Environment::Production => &self.production_url,
        }
    }

    /// POST `body` to the device's endpoint and classify the response
    async fn post<B: Serialize + ?Sized>(
        &self,
        device_token: &str,
        environment: Environment,
        body: &B,
    ) -> SendOutcome {
        let url = format!("{}/3/device/{}", self.endpoint(environment), device_token);

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .header("apns-push-type", "background")
            .header("apns-priority", "5")
            .json(body);
        if let Some(topic) = &self.topic {
            request = request.header("apns-topic", topic);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "Request timed out".to_string()
                } else {
                    format!("Request failed: {}", e)
                };
                tracing::warn!(
                    device_token = %short_token(device_token),
                    environment = %environment,
                    reason = %reason,
                    "Push request failed"
                );
                return SendOutcome::TransientFailure(reason);
            }
        };

        let status = response.status().as_u16();
        let reason = if response.status().is_success() {
            None
        } else {
            response
                .json::<ErrorBody>()
                .await
                .unwrap_or_default()
                .reason
        };

        let outcome = classify(status, reason.as_deref());
        tracing::debug!(
            device_token = %short_token(device_token),
            environment = %environment,
            status,
            outcome = ?outcome.kind(),
            "Push response"
        );
        outcome
    }
}

#[async_trait]
impl NotificationSender for HttpPushSender {
    async fn send(
        &self,
        device_token: &str,
        environment: Environment,
        payload: &NotificationPayload,
    ) -> SendOutcome {
        self.post(device_token, environment, &PushBody::silent(payload))
            .await
    }

    async fn send_silent(&self, device_token: &str, environment: Environment) -> SendOutcome {
        self.post(device_token, environment, &CheckBody::new()).await
    }

    fn sender_name(&self) -> &'static str {
        "push-http"
    }
}
