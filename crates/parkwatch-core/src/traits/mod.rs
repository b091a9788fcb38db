//! Core traits for the pipeline
//!
//! This module defines the abstract interfaces for the collaborators that sit
//! outside the pipeline core.
//!
//! - [`FeedSource`]: Connect to the upstream live-data feed
//! - [`NotificationSender`]: Deliver one push notification to one device
//! - [`DeviceStore`]: Durable device registrations, delivery audit log and
//!   client receipts

pub mod device_store;
pub mod feed_source;
pub mod notification_sender;

pub use device_store::{
    AuditRecord, DeliveryOutcome, DeliveryReceipt, DeviceRegistration, DeviceStore, Environment,
};
pub use feed_source::{FeedConnection, FeedEventKind, FeedFrame, FeedSource, LiveDataEvent};
pub use notification_sender::{NotificationPayload, NotificationSender, SendOutcome};
