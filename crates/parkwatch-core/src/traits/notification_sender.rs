// # Notification Sender Trait
//
// Defines the interface for delivering one push notification to one device.
//
// ## Implementations
//
// - HTTP push gateway: `parkwatch-push-http` crate
//
// ## Outcome contract
//
// A sender never returns an error. Every attempt is classified into exactly
// one `SendOutcome`, because the delivery pool needs the classification to
// decide whether to evict the device registration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::OperationalStatus;
use crate::traits::device_store::{DeliveryOutcome, Environment};

/// Transition fields carried to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub entity_id: String,
    pub park_id: String,
    pub old_status: OperationalStatus,
    pub new_status: OperationalStatus,
    pub old_wait_time: u32,
    pub new_wait_time: u32,
}

/// Result of a single send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the delivery channel
    Delivered,
    /// Rate limiting, timeout, server error, connection failure
    TransientFailure(String),
    /// Bad or unregistered token; the device will never accept messages again
    PermanentInvalid(String),
}

impl SendOutcome {
    /// Outcome class recorded in the audit log
    pub fn kind(&self) -> DeliveryOutcome {
        match self {
            SendOutcome::Delivered => DeliveryOutcome::Delivered,
            SendOutcome::TransientFailure(_) => DeliveryOutcome::TransientFailure,
            SendOutcome::PermanentInvalid(_) => DeliveryOutcome::PermanentInvalid,
        }
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            SendOutcome::Delivered => None,
            SendOutcome::TransientFailure(reason) | SendOutcome::PermanentInvalid(reason) => {
                Some(reason)
            }
        }
    }
}

/// Trait for notification sender implementations
///
/// # Trust Level: Untrusted
///
/// Senders are isolated, single-shot I/O adapters:
///
/// - ✅ Perform one request to the delivery channel per call
/// - ✅ Choose the endpoint that matches `environment`
/// - ❌ Retry or back off (the pool decides; the current policy is no retry)
/// - ❌ Touch the device registry (eviction is owned by the delivery pool)
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver `payload` to `device_token` over the channel for `environment`
    ///
    /// # Returns
    ///
    /// The classified outcome of this single attempt
    async fn send(
        &self,
        device_token: &str,
        environment: Environment,
        payload: &NotificationPayload,
    ) -> SendOutcome;

    /// Send a content-available push with no transition fields
    ///
    /// Used to check a token at registration time. Classified exactly like
    /// [`NotificationSender::send`].
    async fn send_silent(&self, device_token: &str, environment: Environment) -> SendOutcome;

    /// Sender name (for logging)
    fn sender_name(&self) -> &'static str;
}
