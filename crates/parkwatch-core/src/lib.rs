// # parkwatch-core
//
// Core library for the attraction state-diff and push fan-out pipeline.
//
// ## Architecture Overview
//
// - **EntityStore**: Authoritative attraction state, diff detection
// - **EventBus**: Typed pub/sub with non-blocking, per-subscriber buffers
// - **DeviceRegistry**: Cache-aside view over the persistent DeviceStore
// - **FanOutProcessor**: One delivery job per device per status transition
// - **DeliveryPool**: Bounded job queue, fixed workers, self-healing evictions
// - **IngestionAdapter**: Feed connection lifecycle and frame normalization
// - **Pipeline**: Wires all of the above together
//
// ## Design Principles
//
// 1. **Injected, not global**: Every component receives its collaborators
// 2. **Drop, don't stall**: Diff detection never waits on a slow subscriber
// 3. **Push back, don't drop**: Delivery jobs are never discarded when queued
// 4. **Store is truth**: The registry cache only mirrors confirmed rows
// 5. **Library-First**: Transports and the daemon are thin crates on top

pub mod bus;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod state;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use bus::{EventBus, Subscription};
pub use config::PipelineConfig;
pub use delivery::{DeliveryJob, DeliveryPool, DeliveryQueue};
pub use error::{Error, Result};
pub use fanout::FanOutProcessor;
pub use ingest::{ConnectionState, IngestionAdapter};
pub use pipeline::{Pipeline, PipelineMetrics};
pub use registry::DeviceRegistry;
pub use state::{
    Entity, EntityStore, EntityUpdate, OperationalStatus, StatusTransition, Transition,
    WaitTimeTransition,
};
pub use store::{FileDeviceStore, MemoryDeviceStore};
pub use traits::{DeviceStore, FeedSource, NotificationSender};
