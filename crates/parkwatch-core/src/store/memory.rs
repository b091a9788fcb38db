// # Memory Device Store
//
// In-memory implementation of DeviceStore.
//
// ## Purpose
//
// Provides a fast store that doesn't persist across restarts. Useful for
// tests and for ephemeral deployments where devices re-register on launch.
//
// ## Crash Behavior
//
// - All registrations, audit records and receipts are lost on restart
// - Devices resume receiving notifications after their next registration

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::Error;
use crate::store::DEFAULT_AUDIT_CAPACITY;
use crate::traits::device_store::{AuditRecord, DeliveryReceipt, DeviceRegistration, DeviceStore};

/// In-memory device store
///
/// # Example
///
/// ```rust,no_run
/// use parkwatch_core::store::MemoryDeviceStore;
/// use parkwatch_core::traits::{DeviceRegistration, DeviceStore, Environment};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryDeviceStore::new();
///     let token = "ab".repeat(32);
///
///     let confirmed = store
///         .upsert(&DeviceRegistration::new(&token, "2.4.0", "iPhone", Environment::Production))
///         .await?;
///     assert_eq!(store.get(&token).await?, Some(confirmed));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryDeviceStore {
    inner: Arc<RwLock<MemoryState>>,
    audit_capacity: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: HashMap<String, DeviceRegistration>,
    audits: VecDeque<AuditRecord>,
    next_audit_id: u64,
    receipts: VecDeque<DeliveryReceipt>,
    next_receipt_id: u64,
}

impl MemoryDeviceStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::with_audit_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Create a store that keeps at most `capacity` audit records (and as
    /// many receipts)
    pub fn with_audit_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryState {
                next_audit_id: 1,
                next_receipt_id: 1,
                ..MemoryState::default()
            })),
            audit_capacity: capacity.max(1),
        }
    }

    /// Number of registered devices
    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }

    /// Number of retained audit records
    pub async fn audit_len(&self) -> usize {
        self.inner.read().await.audits.len()
    }
}

impl Default for MemoryDeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn upsert(&self, registration: &DeviceRegistration) -> Result<DeviceRegistration, Error> {
        let mut confirmed = registration.clone();

        let mut state = self.inner.write().await;
        confirmed.last_updated = Utc::now();
        state
            .devices
            .insert(confirmed.device_token.clone(), confirmed.clone());
        Ok(confirmed)
    }

    async fn get(&self, device_token: &str) -> Result<Option<DeviceRegistration>, Error> {
        Ok(self.inner.read().await.devices.get(device_token).cloned())
    }

    async fn get_all(&self) -> Result<Vec<DeviceRegistration>, Error> {
        let state = self.inner.read().await;
        let mut devices: Vec<DeviceRegistration> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(devices)
    }

    async fn delete(&self, device_token: &str) -> Result<(), Error> {
        self.inner.write().await.devices.remove(device_token);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, Error> {
        let mut state = self.inner.write().await;
        let stale: Vec<String> = state
            .devices
            .values()
            .filter(|d| d.last_updated < cutoff)
            .map(|d| d.device_token.clone())
            .collect();
        for token in &stale {
            state.devices.remove(token);
        }
        Ok(stale)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let mut record = record.clone();
        record.id = state.next_audit_id;
        state.next_audit_id += 1;
        state.audits.push_back(record);
        while state.audits.len() > self.audit_capacity {
            state.audits.pop_front();
        }
        Ok(())
    }

    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>, Error> {
        let state = self.inner.read().await;
        Ok(state.audits.iter().rev().take(limit).cloned().collect())
    }

    async fn append_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let mut receipt = receipt.clone();
        receipt.id = state.next_receipt_id;
        state.next_receipt_id += 1;
        state.receipts.push_back(receipt);
        while state.receipts.len() > self.audit_capacity {
            state.receipts.pop_front();
        }
        Ok(())
    }

    async fn recent_receipts(&self, limit: usize) -> Result<Vec<DeliveryReceipt>, Error> {
        let state = self.inner.read().await;
        Ok(state.receipts.iter().rev().take(limit).cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OperationalStatus;
    use crate::traits::device_store::{DeliveryOutcome, Environment};

    fn token(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    fn audit(entity: &str) -> AuditRecord {
        AuditRecord {
            id: 0,
            device_token: token(1),
            timestamp: Utc::now(),
            entity_id: entity.to_string(),
            park_id: "p1".to_string(),
            old_status: OperationalStatus::Down,
            new_status: OperationalStatus::Operating,
            old_wait_minutes: 0,
            new_wait_minutes: 15,
            outcome: DeliveryOutcome::Delivered,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_assigns_server_timestamp() {
        let store = MemoryDeviceStore::new();
        let mut request = DeviceRegistration::new(token(1), "1.0", "iPhone", Environment::Production);
        request.last_updated = DateTime::<Utc>::default();

        let confirmed = store.upsert(&request).await.unwrap();
        assert!(confirmed.last_updated > request.last_updated);
        assert_eq!(store.get(&token(1)).await.unwrap(), Some(confirmed));
    }

    #[tokio::test]
    async fn test_get_all_newest_first() {
        let store = MemoryDeviceStore::new();
        for n in 1..=3 {
            store
                .upsert(&DeviceRegistration::new(token(n), "1.0", "iPhone", Environment::Development))
                .await
                .unwrap();
        }
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].last_updated >= w[1].last_updated));
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = MemoryDeviceStore::new();
        store
            .upsert(&DeviceRegistration::new(token(1), "1.0", "iPhone", Environment::Development))
            .await
            .unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        let removed = store.delete_older_than(cutoff).await.unwrap();
        assert_eq!(removed, vec![token(1)]);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_audit_log_is_capped_newest_first() {
        let store = MemoryDeviceStore::with_audit_capacity(2);
        for entity in ["e1", "e2", "e3"] {
            store.append_audit(&audit(entity)).await.unwrap();
        }

        let recent = store.recent_audits(10).await.unwrap();
        let entities: Vec<&str> = recent.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(entities, vec!["e3", "e2"]);
        assert_eq!(recent[0].id, 3);
    }

    #[tokio::test]
    async fn test_receipt_log_is_capped_newest_first() {
        let store = MemoryDeviceStore::with_audit_capacity(2);
        for entity in ["e1", "e2", "e3"] {
            store
                .append_receipt(&DeliveryReceipt {
                    id: 0,
                    device_token: token(1),
                    client_time: Utc::now(),
                    server_time: Utc::now(),
                    entity_id: entity.to_string(),
                    park_id: "p1".to_string(),
                    old_status: OperationalStatus::Down,
                    new_status: OperationalStatus::Operating,
                    old_wait_time: 0,
                    new_wait_time: 10,
                })
                .await
                .unwrap();
        }

        let recent = store.recent_receipts(10).await.unwrap();
        let entities: Vec<&str> = recent.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(entities, vec!["e3", "e2"]);
        assert_eq!(recent[0].id, 3);
        assert_eq!(store.audit_len().await, 0, "Receipts and audits are separate logs");
    }
}
