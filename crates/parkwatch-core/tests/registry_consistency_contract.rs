//! Architectural Contract Test: Registry Cache Consistency
//!
//! This test verifies that the DeviceRegistry cache only ever mirrors rows
//! the persistent store has confirmed and not since deleted.
//!
//! Constraints verified:
//! - Upsert caches the store's row (authoritative timestamp), never the input
//! - A failed store write leaves the cache untouched
//! - Racing upserts of one token leave the cache holding the last committed row
//! - After delete returns, no read observes the device
//! - A read racing a delete cannot resurrect the device in the cache
//! - A cold get_all reloads exactly once, even with concurrent callers
//!
//! If this test fails, someone has added:
//! - Cache writes before the store confirms
//! - Unordered cache fills after concurrent store writes
//! - A read-through that ignores in-flight deletes
//! - A reload path without single-flight protection

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use parkwatch_core::registry::DeviceRegistry;
use parkwatch_core::traits::{DeviceStore, Environment};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn upsert_caches_store_confirmed_timestamp() {
    let store = CountingDeviceStore::new();
    let registry = DeviceRegistry::new(Arc::new(store.clone()));

    let mut request = registration(1, Environment::Production);
    request.last_updated = Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap();

    let confirmed = registry.upsert(request.clone()).await.unwrap();
    let stored = store.get(&token(1)).await.unwrap().unwrap();

    assert_eq!(confirmed, stored, "Registry must return the committed row");
    assert_ne!(confirmed.last_updated, request.last_updated);

    let reads_before = store.get_calls();
    let cached = registry.get(&token(1)).await.unwrap().unwrap();
    assert_eq!(cached.last_updated, stored.last_updated);
    assert_eq!(
        store.get_calls(),
        reads_before,
        "A confirmed upsert must be served from the cache"
    );
}

#[tokio::test]
async fn failed_store_write_leaves_cache_unchanged() {
    let store = CountingDeviceStore::new();
    let registry = DeviceRegistry::new(Arc::new(store.clone()));
    let original = registry
        .upsert(registration(1, Environment::Development))
        .await
        .unwrap();

    store.fail_writes(true);
    let result = registry
        .upsert(registration(1, Environment::Production))
        .await;
    assert!(result.is_err());

    let cached = registry.get(&token(1)).await.unwrap().unwrap();
    assert_eq!(cached, original, "Cache must still hold the last confirmed row");

    let fresh = registry.upsert(registration(2, Environment::Production)).await;
    assert!(fresh.is_err());
    assert!(
        registry.get(&token(2)).await.is_ok_and(|d| d.is_none()),
        "A device whose write failed must not appear"
    );
}

#[tokio::test]
async fn get_after_delete_never_sees_device() {
    let store = CountingDeviceStore::new();
    let registry = DeviceRegistry::new(Arc::new(store.clone()));
    registry
        .upsert(registration(1, Environment::Production))
        .await
        .unwrap();

    registry.delete(&token(1)).await.unwrap();

    assert!(registry.get(&token(1)).await.unwrap().is_none());
    assert!(registry.get_all().await.unwrap().is_empty());
    assert!(store.get(&token(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn racing_read_cannot_resurrect_deleted_device() {
    let store = CountingDeviceStore::new();
    store.seed(&registration(1, Environment::Production)).await;
    // Widen the window between a read-through's store read and its cache fill
    store.set_read_delay(Duration::from_millis(100));
    let registry = Arc::new(DeviceRegistry::new(Arc::new(store.clone())));

    let reader = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.get(&token(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    registry.delete(&token(1)).await.unwrap();
    let _ = reader.await.unwrap();

    store.set_read_delay(Duration::ZERO);
    assert!(
        registry.get(&token(1)).await.unwrap().is_none(),
        "A read that started before the delete must not repopulate the cache"
    );
    assert_eq!(registry.cached_len().await, 0);
}

#[tokio::test]
async fn concurrent_cold_get_all_reloads_once() {
    let store = CountingDeviceStore::new();
    for n in 1..=5 {
        store.seed(&registration(n, Environment::Production)).await;
    }
    store.set_read_delay(Duration::from_millis(50));
    let registry = Arc::new(DeviceRegistry::new(Arc::new(store.clone())));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_all().await })
        })
        .collect();

    for caller in callers {
        let devices = caller.await.unwrap().unwrap();
        assert_eq!(devices.len(), 5, "Every caller sees the complete set");
    }

    assert_eq!(store.get_all_calls(), 1, "Cold cache must reload exactly once");
    assert_eq!(registry.reload_count(), 1);

    for _ in 0..3 {
        assert_eq!(registry.get_all().await.unwrap().len(), 5);
    }
    assert_eq!(
        store.get_all_calls(),
        1,
        "A warm cache must not reload for unchanged data"
    );
}

#[tokio::test]
async fn get_all_is_newest_first() {
    let store = CountingDeviceStore::new();
    let registry = DeviceRegistry::new(Arc::new(store.clone()));
    for n in 1..=3 {
        registry
            .upsert(registration(n, Environment::Development))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let tokens: Vec<_> = registry
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.device_token)
        .collect();
    assert_eq!(tokens, vec![token(3), token(2), token(1)]);
}

#[tokio::test]
async fn failed_reload_is_an_error_not_an_empty_set() {
    let store = CountingDeviceStore::new();
    store.seed(&registration(1, Environment::Production)).await;
    store.fail_reads(true);
    let registry = DeviceRegistry::new(Arc::new(store.clone()));

    assert!(registry.get_all().await.is_err());
    assert_eq!(registry.warm().await, 0, "warm() logs and carries on");

    store.fail_reads(false);
    assert_eq!(registry.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn racing_upserts_cache_the_last_committed_row() {
    let store = CountingDeviceStore::new();
    // The first write commits at once but reports back late
    store.delay_upsert_return("slow", Duration::from_millis(100));
    let registry = Arc::new(DeviceRegistry::new(Arc::new(store.clone())));

    let mut first = registration(1, Environment::Development);
    first.app_version = "slow".to_string();
    let mut second = registration(1, Environment::Production);
    second.app_version = "fast".to_string();

    let slow = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.upsert(first).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.upsert(second).await.unwrap();
    slow.await.unwrap().unwrap();

    let cached = registry.get(&token(1)).await.unwrap().unwrap();
    let stored = store.get(&token(1)).await.unwrap().unwrap();
    assert_eq!(cached, stored, "Cache must match the row the store committed last");
    assert_eq!(cached.app_version, "fast");
    assert_eq!(cached.environment, Environment::Production);

    let all = registry.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].environment, Environment::Production);
}
