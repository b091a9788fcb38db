//! Cache-aside device registry
//!
//! The registry is the sole authority over device registrations. The
//! persistent [`DeviceStore`] is the source of truth; the registry keeps an
//! in-memory mirror of it for the fan-out hot path.
//!
//! ## Consistency rules
//!
//! - **Upsert**: store first, then cache the row the store confirmed (with
//!   its server-assigned `last_updated`), never the caller's value. Upserts
//!   of one token are serialized end to end, so the cache is written in the
//!   order the store committed.
//! - **Get**: cache, then read-through on a miss.
//! - **GetAll**: an empty cache means "cold"; one caller reloads the full
//!   set while concurrent callers wait for that reload instead of repeating
//!   it.
//! - **Delete**: cache first, then store. While a delete is in flight the
//!   token is marked pending, so read-through cannot put it back.
//!
//! Every removal bumps a cache epoch. A read-through or reload that
//! observes a changed epoch does not populate the cache from what may be a
//! pre-delete read. The cache can therefore only hold rows the store has
//! confirmed and not since deleted.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use parkwatch_core::registry::DeviceRegistry;
//!
//! let registry = DeviceRegistry::new(store);
//! registry.warm().await;
//!
//! let confirmed = registry.upsert(registration).await?;
//! let devices = registry.get_all().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::traits::device_store::{DeviceRegistration, DeviceStore, short_token};

/// Read-through attempts before returning an uncached result
const MAX_READ_ATTEMPTS: usize = 3;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, DeviceRegistration>,
    /// In-flight deletes per token
    pending_deletes: HashMap<String, usize>,
    /// Bumped on every removal
    epoch: u64,
}

impl CacheState {
    fn is_pending(&self, token: &str) -> bool {
        self.pending_deletes.contains_key(token)
    }
}

/// Device registry with a cache in front of the persistent store
///
/// ## Thread Safety
///
/// The cache sits behind a `RwLock`: concurrent reads, exclusive mutation.
/// Store I/O never happens while the cache lock is held.
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    cache: RwLock<CacheState>,
    /// Single-flight guard for cold reloads
    reload_lock: Mutex<()>,
    /// Per-token guards spanning an upsert's store write and cache fill
    upsert_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reloads: AtomicU64,
}

impl DeviceRegistry {
    /// Create a registry over `store` with an empty cache
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(CacheState::default()),
            reload_lock: Mutex::new(()),
            upsert_locks: std::sync::Mutex::new(HashMap::new()),
            reloads: AtomicU64::new(0),
        }
    }

    /// Register or refresh a device
    ///
    /// # Returns
    ///
    /// - `Ok(DeviceRegistration)`: The row as committed by the store
    /// - `Err(Error::InvalidInput)`: Malformed token; nothing was written
    /// - `Err(Error)`: Store failure; the cache is unchanged
    pub async fn upsert(&self, registration: DeviceRegistration) -> Result<DeviceRegistration> {
        registration.validate()?;

        let token_lock = self.upsert_lock(&registration.device_token);
        let guard = token_lock.lock().await;
        let result = self.upsert_serialized(&registration).await;
        drop(guard);
        self.release_upsert_lock(&registration.device_token, token_lock);

        let confirmed = result?;

        info!(
            device_token = %short_token(&confirmed.device_token),
            environment = %confirmed.environment,
            app_version = %confirmed.app_version,
            "Registered device"
        );
        Ok(confirmed)
    }

    async fn upsert_serialized(&self, registration: &DeviceRegistration) -> Result<DeviceRegistration> {
        let epoch = self.cache.read().await.epoch;
        let confirmed = self.store.upsert(registration).await?;

        let mut cache = self.cache.write().await;
        if cache.epoch == epoch && !cache.is_pending(&confirmed.device_token) {
            cache
                .entries
                .insert(confirmed.device_token.clone(), confirmed.clone());
        } else {
            // A delete raced with this write; let the next read decide.
            cache.entries.remove(&confirmed.device_token);
        }
        Ok(confirmed)
    }

    fn upsert_lock(&self, device_token: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .upsert_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(device_token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the token's guard once no other upsert holds a handle to it
    fn release_upsert_lock(&self, device_token: &str, token_lock: Arc<Mutex<()>>) {
        let mut locks = self
            .upsert_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One handle in the map, one here
        if Arc::strong_count(&token_lock) == 2 {
            locks.remove(device_token);
        }
    }

    /// Look up one device
    ///
    /// # Returns
    ///
    /// - `Ok(Some(DeviceRegistration))`: Found in cache or store
    /// - `Ok(None)`: Unknown, or a delete for it is in flight
    /// - `Err(Error)`: Store failure on a cache miss
    pub async fn get(&self, device_token: &str) -> Result<Option<DeviceRegistration>> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let epoch = {
                let cache = self.cache.read().await;
                if let Some(hit) = cache.entries.get(device_token) {
                    return Ok(Some(hit.clone()));
                }
                if cache.is_pending(device_token) {
                    return Ok(None);
                }
                cache.epoch
            };

            let found = self.store.get(device_token).await?;

            let mut cache = self.cache.write().await;
            if cache.epoch == epoch {
                if let Some(found) = &found {
                    cache
                        .entries
                        .entry(device_token.to_string())
                        .or_insert_with(|| found.clone());
                }
                return Ok(found);
            }
            drop(cache);

            if attempt >= MAX_READ_ATTEMPTS {
                return Ok(found);
            }
        }
    }

    /// Every registered device, most recently updated first
    ///
    /// An empty cache triggers one full reload from the store.
    pub async fn get_all(&self) -> Result<Vec<DeviceRegistration>> {
        if let Some(devices) = self.cached_snapshot().await {
            return Ok(devices);
        }

        let _reloading = self.reload_lock.lock().await;

        // Another caller may have finished the reload while we waited.
        if let Some(devices) = self.cached_snapshot().await {
            return Ok(devices);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let epoch = self.cache.read().await.epoch;
            let devices = self.store.get_all().await?;
            self.reloads.fetch_add(1, Ordering::Relaxed);

            let mut cache = self.cache.write().await;
            if cache.epoch == epoch {
                for device in &devices {
                    cache
                        .entries
                        .entry(device.device_token.clone())
                        .or_insert_with(|| device.clone());
                }
                debug!(devices = devices.len(), "Reloaded device cache");
                return Ok(sorted(cache.entries.values().cloned().collect()));
            }
            drop(cache);

            if attempt >= MAX_READ_ATTEMPTS {
                return Ok(devices);
            }
        }
    }

    /// Remove a device
    ///
    /// Once this returns `Ok`, `get` no longer returns the device.
    pub async fn delete(&self, device_token: &str) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            cache.entries.remove(device_token);
            *cache
                .pending_deletes
                .entry(device_token.to_string())
                .or_insert(0) += 1;
            cache.epoch += 1;
        }

        let result = self.store.delete(device_token).await;

        {
            let mut cache = self.cache.write().await;
            if let Some(count) = cache.pending_deletes.get_mut(device_token) {
                *count -= 1;
                if *count == 0 {
                    cache.pending_deletes.remove(device_token);
                }
            }
            cache.epoch += 1;
        }

        match &result {
            Ok(()) => info!(device_token = %short_token(device_token), "Removed device"),
            Err(e) => warn!(
                device_token = %short_token(device_token),
                error = %e,
                "Failed to remove device from store"
            ),
        }
        result
    }

    /// Pre-fill the cache at start-up
    ///
    /// Failure is logged and not fatal; the first `get_all` retries the load.
    pub async fn warm(&self) -> usize {
        match self.get_all().await {
            Ok(devices) => {
                info!(devices = devices.len(), "Device cache warmed");
                devices.len()
            }
            Err(e) => {
                warn!(error = %e, "Failed to warm device cache");
                0
            }
        }
    }

    /// Remove every device not re-registered within `max_age`
    ///
    /// # Returns
    ///
    /// Number of devices removed
    pub async fn evict_stale(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let removed = self.store.delete_older_than(cutoff).await?;

        if !removed.is_empty() {
            let mut cache = self.cache.write().await;
            for token in &removed {
                cache.entries.remove(token);
            }
            cache.epoch += 1;
            info!(removed = removed.len(), %cutoff, "Evicted stale devices");
        }
        Ok(removed.len())
    }

    /// Devices currently held in the cache
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    /// Number of full reloads performed
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    async fn cached_snapshot(&self) -> Option<Vec<DeviceRegistration>> {
        let cache = self.cache.read().await;
        if cache.entries.is_empty() {
            None
        } else {
            Some(sorted(cache.entries.values().cloned().collect()))
        }
    }
}

fn sorted(mut devices: Vec<DeviceRegistration>) -> Vec<DeviceRegistration> {
    devices.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.device_token.cmp(&b.device_token))
    });
    devices
}
