// # File Device Store
//
// File-based implementation of DeviceStore with crash recovery.
//
// ## Purpose
//
// Keeps device registrations, the delivery audit log and client receipts
// across daemon restarts and crashes.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good file
// - Recovery: Falls back to backup if corruption detected
//
// ## Write Policy
//
// Registration changes are written before the call returns. Audit and
// receipt appends only mark the store dirty; they reach disk on the next
// registration write or `flush()`.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "devices": {
//     "a1b2...": {
//       "deviceToken": "a1b2...",
//       "appVersion": "2.4.0",
//       "deviceType": "iPhone",
//       "environment": "production",
//       "lastUpdated": "2025-01-09T12:00:00Z"
//     }
//   },
//   "audits": [],
//   "nextAuditId": 1,
//   "receipts": [],
//   "nextReceiptId": 1
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::Error;
use crate::store::DEFAULT_AUDIT_CAPACITY;
use crate::traits::device_store::{AuditRecord, DeliveryReceipt, DeviceRegistration, DeviceStore};

/// Store file format version
const STORE_FILE_VERSION: &str = "1.0";

/// File-based device store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use parkwatch_core::store::FileDeviceStore;
/// use parkwatch_core::traits::{DeviceRegistration, DeviceStore, Environment};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileDeviceStore::open("/var/lib/parkwatch/devices.json").await?;
///     let token = "ab".repeat(32);
///
///     // Written to disk before returning
///     store
///         .upsert(&DeviceRegistration::new(&token, "2.4.0", "iPhone", Environment::Production))
///         .await?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileDeviceStore {
    path: PathBuf,
    state: RwLock<FileState>,
    /// Serializes snapshot + write so an older snapshot never lands last
    write_lock: Mutex<()>,
    audit_capacity: usize,
}

#[derive(Debug, Default)]
struct FileState {
    devices: HashMap<String, DeviceRegistration>,
    audits: VecDeque<AuditRecord>,
    next_audit_id: u64,
    receipts: VecDeque<DeliveryReceipt>,
    next_receipt_id: u64,
    dirty: bool,
}

/// Serializable store file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFileFormat {
    version: String,
    #[serde(default)]
    devices: HashMap<String, DeviceRegistration>,
    #[serde(default)]
    audits: VecDeque<AuditRecord>,
    #[serde(default = "first_id")]
    next_audit_id: u64,
    #[serde(default)]
    receipts: VecDeque<DeliveryReceipt>,
    #[serde(default = "first_id")]
    next_receipt_id: u64,
}

fn first_id() -> u64 {
    1
}

impl StoreFileFormat {
    fn empty() -> Self {
        Self {
            version: STORE_FILE_VERSION.to_string(),
            devices: HashMap::new(),
            audits: VecDeque::new(),
            next_audit_id: first_id(),
            receipts: VecDeque::new(),
            next_receipt_id: first_id(),
        }
    }
}

impl FileDeviceStore {
    /// Open or create a file device store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing file, falling back to the backup on corruption
    /// 3. Write an initial file if none exists, so an unwritable location
    ///    fails here rather than on the first registration
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open_with_audit_capacity(path, DEFAULT_AUDIT_CAPACITY).await
    }

    /// Open or create a store that keeps at most `capacity` audit records
    /// (and as many receipts)
    pub async fn open_with_audit_capacity<P: AsRef<Path>>(
        path: P,
        capacity: usize,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::store(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let existed = path.exists();
        let file = Self::load_with_recovery(&path).await?;
        tracing::info!(
            path = %path.display(),
            devices = file.devices.len(),
            audits = file.audits.len(),
            receipts = file.receipts.len(),
            "Opened device store"
        );

        let store = Self {
            path,
            state: RwLock::new(FileState {
                devices: file.devices,
                audits: file.audits,
                next_audit_id: file.next_audit_id.max(first_id()),
                receipts: file.receipts,
                next_receipt_id: file.next_receipt_id.max(first_id()),
                dirty: false,
            }),
            write_lock: Mutex::new(()),
            audit_capacity: capacity.max(1),
        };

        if !existed {
            store.write_file().await?;
        }

        Ok(store)
    }

    /// Load the store file, recovering from the backup on corruption
    ///
    /// Recovery strategy:
    /// 1. Try to load main file
    /// 2. If it does not parse, try loading backup (and restore it)
    /// 3. If backup also fails, start empty
    ///
    /// Read errors other than corruption are returned.
    async fn load_with_recovery(path: &Path) -> Result<StoreFileFormat, Error> {
        match Self::load_file(path).await {
            Ok(file) => Ok(file),
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Store file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty store.");
                    return Ok(StoreFileFormat::empty());
                }

                match Self::load_file(&backup_path).await {
                    Ok(file) => {
                        tracing::info!(
                            "Recovered store from backup: {} devices",
                            file.devices.len()
                        );
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore store file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(file)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with empty store.",
                            backup_err
                        );
                        Ok(StoreFileFormat::empty())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load_file(path: &Path) -> Result<StoreFileFormat, Error> {
        if !path.exists() {
            tracing::debug!("Store file does not exist: {}", path.display());
            return Ok(StoreFileFormat::empty());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!(
                "Failed to read store file {}: {}",
                path.display(),
                e
            ))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content)?;

        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }

        Ok(file)
    }

    /// Write the current state to disk atomically
    async fn write_file(&self) -> Result<(), Error> {
        let _writing = self.write_lock.lock().await;

        let json = {
            let state = self.state.read().await;
            let file = StoreFileFormat {
                version: STORE_FILE_VERSION.to_string(),
                devices: state.devices.clone(),
                audits: state.audits.clone(),
                next_audit_id: state.next_audit_id,
                receipts: state.receipts.clone(),
                next_receipt_id: state.next_receipt_id,
            };
            serde_json::to_string_pretty(&file)
                .map_err(|e| Error::store(format!("Failed to serialize store: {}", e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("Store written to file: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn upsert(&self, registration: &DeviceRegistration) -> Result<DeviceRegistration, Error> {
        let mut confirmed = registration.clone();

        let previous = {
            let mut state = self.state.write().await;
            confirmed.last_updated = Utc::now();
            state.dirty = true;
            state
                .devices
                .insert(confirmed.device_token.clone(), confirmed.clone())
        };

        if let Err(e) = self.write_file().await {
            // Not committed; put back what was there.
            let mut state = self.state.write().await;
            match previous {
                Some(prev) => state.devices.insert(prev.device_token.clone(), prev),
                None => state.devices.remove(&confirmed.device_token),
            };
            return Err(e);
        }

        Ok(confirmed)
    }

    async fn get(&self, device_token: &str) -> Result<Option<DeviceRegistration>, Error> {
        Ok(self.state.read().await.devices.get(device_token).cloned())
    }

    async fn get_all(&self) -> Result<Vec<DeviceRegistration>, Error> {
        let state = self.state.read().await;
        let mut devices: Vec<DeviceRegistration> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(devices)
    }

    async fn delete(&self, device_token: &str) -> Result<(), Error> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.devices.remove(device_token);
            if removed.is_some() {
                state.dirty = true;
            }
            removed
        };

        if removed.is_some() {
            self.write_file().await?;
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, Error> {
        let stale: Vec<String> = {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .devices
                .values()
                .filter(|d| d.last_updated < cutoff)
                .map(|d| d.device_token.clone())
                .collect();
            for token in &stale {
                state.devices.remove(token);
            }
            if !stale.is_empty() {
                state.dirty = true;
            }
            stale
        };

        if !stale.is_empty() {
            self.write_file().await?;
        }
        Ok(stale)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let mut record = record.clone();
        record.id = state.next_audit_id;
        state.next_audit_id += 1;
        state.audits.push_back(record);
        while state.audits.len() > self.audit_capacity {
            state.audits.pop_front();
        }
        state.dirty = true;
        Ok(())
    }

    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>, Error> {
        let state = self.state.read().await;
        Ok(state.audits.iter().rev().take(limit).cloned().collect())
    }

    async fn append_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let mut receipt = receipt.clone();
        receipt.id = state.next_receipt_id;
        state.next_receipt_id += 1;
        state.receipts.push_back(receipt);
        while state.receipts.len() > self.audit_capacity {
            state.receipts.pop_front();
        }
        state.dirty = true;
        Ok(())
    }

    async fn recent_receipts(&self, limit: usize) -> Result<Vec<DeliveryReceipt>, Error> {
        let state = self.state.read().await;
        Ok(state.receipts.iter().rev().take(limit).cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        if self.state.read().await.dirty {
            self.write_file().await
        } else {
            Ok(())
        }
    }
}
