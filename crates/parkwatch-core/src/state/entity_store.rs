// # Entity Store
//
// Concurrent map of entity id -> current state, with diff detection.
//
// ## Locking
//
// - The outer `RwLock` guards map membership only. It is held for a lookup
//   or, on first sight of an id, for the insert.
// - Each entity sits behind its own `Mutex`. `apply` holds it while diffing
//   and publishing, so updates (and the events they produce) for one id are
//   strictly ordered while different ids never contend.
// - Snapshots clone the slot handles under the read lock, then lock entities
//   one at a time. A snapshot is atomic per entity, not across entities.
//
// Neither lock is held across an `.await`; `apply` is synchronous.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bus::EventBus;
use crate::state::{
    Entity, EntityUpdate, OperationalStatus, StatusTransition, Transition, WaitTimeTransition,
};

type Slot = Arc<Mutex<Entity>>;

/// Authoritative entity state with transition detection
///
/// Transitions are published on the injected `EventBus` and also returned
/// to the caller.
pub struct EntityStore {
    entities: RwLock<HashMap<String, Slot>>,
    bus: EventBus,
}

impl EntityStore {
    /// Create an empty store publishing on `bus`
    pub fn new(bus: EventBus) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Apply a proposed new state
    ///
    /// The first observation of an id is a silent bootstrap: both change
    /// timestamps are set and nothing is published. After that, status and
    /// wait are diffed independently against the stored values and one
    /// transition is produced per differing field.
    pub fn apply(&self, update: EntityUpdate) -> Vec<Transition> {
        let slot = match self.slot(&update.entity_id) {
            Some(slot) => slot,
            None => {
                let mut map = self.entities.write().unwrap_or_else(PoisonError::into_inner);
                match map.entry(update.entity_id.clone()) {
                    // Lost the insert race; diff against the winner.
                    Entry::Occupied(existing) => existing.get().clone(),
                    Entry::Vacant(vacant) => {
                        debug!(
                            entity_id = %update.entity_id,
                            status = %update.status,
                            wait_minutes = update.wait_minutes,
                            "Bootstrapped entity"
                        );
                        vacant.insert(Arc::new(Mutex::new(bootstrap(update, Utc::now()))));
                        return Vec::new();
                    }
                }
            }
        };

        let mut entity = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // Read under the entity lock so change times follow apply order
        let now = Utc::now()
            .max(entity.status_changed_at)
            .max(entity.wait_changed_at);
        let transitions = diff(&mut entity, update, now);

        for transition in &transitions {
            match transition {
                Transition::Status(event) => {
                    debug!(
                        entity_id = %event.entity_id,
                        old = %event.old_status,
                        new = %event.new_status,
                        "Status transition"
                    );
                    self.bus.status().publish(event.clone());
                }
                Transition::WaitTime(event) => {
                    debug!(
                        entity_id = %event.entity_id,
                        old = event.old_wait_minutes,
                        new = event.new_wait_minutes,
                        "Wait time transition"
                    );
                    self.bus.wait_time().publish(event.clone());
                }
            }
        }

        transitions
    }

    /// Current state of one entity
    pub fn get(&self, entity_id: &str) -> Option<Entity> {
        let slot = self.slot(entity_id)?;
        let entity = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(entity.clone())
    }

    /// Snapshot of every entity, sorted by id
    pub fn all(&self) -> Vec<Entity> {
        let slots: Vec<Slot> = {
            let map = self.entities.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };

        let mut entities: Vec<Entity> = slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    /// Number of known entities
    pub fn len(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entity count per operational status
    pub fn status_counts(&self) -> HashMap<OperationalStatus, usize> {
        let mut counts = HashMap::new();
        for entity in self.all() {
            *counts.entry(entity.status).or_insert(0) += 1;
        }
        counts
    }

    fn slot(&self, entity_id: &str) -> Option<Slot> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }
}

fn bootstrap(update: EntityUpdate, now: DateTime<Utc>) -> Entity {
    Entity {
        id: update.entity_id,
        name: update.name,
        category: update.category,
        park_id: update.park_id,
        status: update.status,
        wait_minutes: update.wait_minutes,
        status_changed_at: now,
        wait_changed_at: now,
    }
}

fn diff(entity: &mut Entity, update: EntityUpdate, now: DateTime<Utc>) -> Vec<Transition> {
    let mut transitions = Vec::new();
    let old_status = entity.status;
    let old_wait = entity.wait_minutes;

    // Descriptive fields follow the feed but are never evented.
    entity.name = update.name;
    entity.category = update.category;
    entity.park_id = update.park_id;

    if update.status != old_status {
        entity.status = update.status;
        entity.status_changed_at = now;
        transitions.push(Transition::Status(StatusTransition {
            entity_id: entity.id.clone(),
            park_id: entity.park_id.clone(),
            old_status,
            new_status: update.status,
            old_wait_minutes: old_wait,
            new_wait_minutes: update.wait_minutes,
            detected_at: now,
        }));
    }

    if update.wait_minutes != old_wait {
        entity.wait_minutes = update.wait_minutes;
        entity.wait_changed_at = now;
        transitions.push(Transition::WaitTime(WaitTimeTransition {
            entity_id: entity.id.clone(),
            park_id: entity.park_id.clone(),
            old_wait_minutes: old_wait,
            new_wait_minutes: update.wait_minutes,
            detected_at: now,
        }));
    }

    transitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (EntityStore, EventBus) {
        let bus = EventBus::new(16);
        (EntityStore::new(bus.clone()), bus)
    }

    #[test]
    fn test_first_observation_is_silent() {
        let (store, bus) = store();
        let mut status = bus.status().subscribe();

        let transitions = store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Down, 0));

        assert!(transitions.is_empty());
        assert!(status.try_recv().is_none());
        let entity = store.get("e1").unwrap();
        assert_eq!(entity.status_changed_at, entity.wait_changed_at);
    }

    #[test]
    fn test_independent_field_diffs() {
        let (store, _bus) = store();
        store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Down, 0));
        let before = store.get("e1").unwrap();

        let transitions = store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Down, 30));
        assert_eq!(transitions.len(), 1);
        assert!(matches!(transitions[0], Transition::WaitTime(_)));

        let after = store.get("e1").unwrap();
        assert_eq!(after.status_changed_at, before.status_changed_at);
        assert!(after.wait_changed_at >= before.wait_changed_at);
    }

    #[test]
    fn test_both_fields_change() {
        let (store, _bus) = store();
        store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Down, 0));

        let transitions =
            store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Operating, 45));

        assert_eq!(transitions.len(), 2);
        match &transitions[0] {
            Transition::Status(t) => {
                assert_eq!(t.old_status, OperationalStatus::Down);
                assert_eq!(t.new_status, OperationalStatus::Operating);
                assert_eq!(t.old_wait_minutes, 0);
                assert_eq!(t.new_wait_minutes, 45);
            }
            other => panic!("expected status transition, got {:?}", other),
        }
    }

    #[test]
    fn test_descriptive_fields_not_evented() {
        let (store, _bus) = store();
        store.apply(
            EntityUpdate::new("e1", "p1", OperationalStatus::Operating, 10)
                .with_details("Old Name", "ATTRACTION"),
        );
        let transitions = store.apply(
            EntityUpdate::new("e1", "p1", OperationalStatus::Operating, 10)
                .with_details("New Name", "ATTRACTION"),
        );
        assert!(transitions.is_empty());
        assert_eq!(store.get("e1").unwrap().name, "New Name");
    }

    #[test]
    fn test_snapshot_and_counts() {
        let (store, _bus) = store();
        store.apply(EntityUpdate::new("b", "p1", OperationalStatus::Operating, 5));
        store.apply(EntityUpdate::new("a", "p1", OperationalStatus::Operating, 5));
        store.apply(EntityUpdate::new("c", "p1", OperationalStatus::Closed, 0));

        let ids: Vec<String> = store.all().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let counts = store.status_counts();
        assert_eq!(counts.get(&OperationalStatus::Operating), Some(&2));
        assert_eq!(counts.get(&OperationalStatus::Closed), Some(&1));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_change_times_follow_apply_order() {
        let bus = EventBus::new(4096);
        let store = Arc::new(EntityStore::new(bus.clone()));
        let mut status = bus.status().subscribe();
        store.apply(EntityUpdate::new("e1", "p1", OperationalStatus::Down, 0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..200u32 {
                        let next = if (t + n) % 2 == 0 {
                            OperationalStatus::Operating
                        } else {
                            OperationalStatus::Down
                        };
                        store.apply(EntityUpdate::new("e1", "p1", next, n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut detected = Vec::new();
        while let Some(event) = status.try_recv() {
            detected.push(event.detected_at);
        }
        assert!(!detected.is_empty());
        assert!(
            detected.windows(2).all(|w| w[0] <= w[1]),
            "Transitions published in apply order must carry non-decreasing times"
        );
        assert_eq!(store.get("e1").unwrap().status_changed_at, *detected.last().unwrap());
    }
}
