// # Device Store Implementations
//
// This module provides implementations of the DeviceStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::FileDeviceStore;
pub use memory::MemoryDeviceStore;

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::traits::DeviceStore;

/// Newest audit records retained by the built-in stores
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Open the store selected by `config`
///
/// Failure here is a start-up failure: the pipeline cannot run without its
/// source of truth for device registrations.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn DeviceStore>, crate::Error> {
    match config {
        StoreConfig::File { path } => Ok(Arc::new(FileDeviceStore::open(path).await?)),
        StoreConfig::Memory => Ok(Arc::new(MemoryDeviceStore::new())),
    }
}
