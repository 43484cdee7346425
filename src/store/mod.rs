use crate::entity::{self, filter::CompiledFilter};
use crate::error::WorldError;
use crate::pb::{ChangeKind, Entity, EntityChange};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod expiry;
use expiry::ExpiryIndex;


const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of applying a partial entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    entity: Entity,
    version: u64,
    /// Whether a terminal (`Expired`/`Unobserved`) event has been emitted.
    expired_emitted: bool,
}

/// Authoritative in-memory entity map.
///
/// Reads go straight to the concurrent map; every mutation is serialized
/// through a single write lock so each push appears atomic to observers and
/// the change stream carries the merged post-state in apply order.
pub struct WorldStore {
    entities: DashMap<String, StoredEntity>,
    write: Mutex<()>,
    expiry: Mutex<ExpiryIndex>,
    change_tx: broadcast::Sender<EntityChange>,
    version: AtomicU64,
    node_id: String,
    grace_ms: i64,
}

impl WorldStore {
    pub fn new(node_id: &str, grace_ms: i64) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entities: DashMap::new(),
            write: Mutex::new(()),
            expiry: Mutex::new(ExpiryIndex::new()),
            change_tx,
            version: AtomicU64::new(0),
            node_id: node_id.to_string(),
            grace_ms,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to the change stream. Events for a given entity arrive in
    /// apply order; a lagged receiver must resynchronize with a fresh replay.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityChange> {
        self.change_tx.subscribe()
    }

    /// Merges a partial entity and broadcasts the merged post-state. A push
    /// whose merged lifetime is already past additionally emits `Expired`
    /// right away so watchers never wait on the purge cadence for it.
    pub fn apply(&self, partial: Entity) -> Result<Applied, WorldError> {
        entity::validate(&partial)?;

        let _guard = self.write.lock().expect("store write lock poisoned");
        let now = entity::now_ms();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let id = partial.id.clone();

        let (applied, merged) = match self.entities.get_mut(&id) {
            Some(mut stored) => {
                entity::merge(&mut stored.entity, partial);
                entity::default_controller_node(&mut stored.entity, &self.node_id);
                stored.version = version;
                if !entity::is_expired(&stored.entity, now) {
                    stored.expired_emitted = false;
                }
                (Applied::Updated, stored.entity.clone())
            }
            None => {
                let mut fresh = partial;
                entity::default_controller_node(&mut fresh, &self.node_id);
                let stored = StoredEntity {
                    entity: fresh.clone(),
                    version,
                    expired_emitted: false,
                };
                self.entities.insert(id.clone(), stored);
                (Applied::Created, fresh)
            }
        };

        if let Some(until) = entity::until_ms(&merged) {
            self.expiry
                .lock()
                .expect("expiry lock poisoned")
                .schedule(until, &id);
        }

        self.emit(ChangeKind::Updated, merged.clone(), now);

        if entity::is_expired(&merged, now) {
            if let Some(mut stored) = self.entities.get_mut(&id) {
                if !stored.expired_emitted {
                    stored.expired_emitted = true;
                    drop(stored);
                    self.emit(ChangeKind::Expired, merged, now);
                }
            }
        }

        Ok(applied)
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|stored| stored.entity.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Snapshot of every entity matching the filter, sorted by id so
    /// listings are deterministic.
    pub fn list(&self, filter: &CompiledFilter) -> Vec<Entity> {
        let mut matched: Vec<Entity> = self
            .entities
            .iter()
            .filter(|stored| filter.matches(&stored.entity))
            .map(|stored| stored.entity.clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn all_entities(&self) -> Vec<Entity> {
        self.list(&CompiledFilter::match_all())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Explicit expiry: stamps `lifetime.until = now` and emits `Expired`.
    pub fn expire(&self, id: &str) -> Result<(), WorldError> {
        let _guard = self.write.lock().expect("store write lock poisoned");
        let now = entity::now_ms();

        let merged = {
            let mut stored = self
                .entities
                .get_mut(id)
                .ok_or_else(|| WorldError::NotFound(id.to_string()))?;
            if !entity::is_expired(&stored.entity, now) {
                entity::set_until(&mut stored.entity, now);
            }
            stored.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            if stored.expired_emitted {
                return Ok(());
            }
            stored.expired_emitted = true;
            stored.entity.clone()
        };

        self.expiry
            .lock()
            .expect("expiry lock poisoned")
            .schedule(entity::until_ms(&merged).unwrap_or(now), id);
        self.emit(ChangeKind::Expired, merged, now);
        Ok(())
    }

    /// Adapter signal that an entity's source went silent. The entity is
    /// stamped expired and an `Unobserved` event replaces the `Expired` one.
    pub fn mark_unobserved(&self, id: &str) -> Result<(), WorldError> {
        let _guard = self.write.lock().expect("store write lock poisoned");
        let now = entity::now_ms();

        let merged = {
            let mut stored = self
                .entities
                .get_mut(id)
                .ok_or_else(|| WorldError::NotFound(id.to_string()))?;
            if !entity::is_expired(&stored.entity, now) {
                entity::set_until(&mut stored.entity, now);
            }
            stored.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            if stored.expired_emitted {
                return Ok(());
            }
            stored.expired_emitted = true;
            stored.entity.clone()
        };

        self.expiry
            .lock()
            .expect("expiry lock poisoned")
            .schedule(entity::until_ms(&merged).unwrap_or(now), id);
        self.emit(ChangeKind::Unobserved, merged, now);
        Ok(())
    }

    /// Walks the expiry index: emits `Expired` for entities whose deadline
    /// passed, evicts those past the grace window, and reschedules the rest.
    /// Returns the number of evicted entities.
    pub fn purge(&self, now: i64) -> usize {
        let _guard = self.write.lock().expect("store write lock poisoned");

        let due = self
            .expiry
            .lock()
            .expect("expiry lock poisoned")
            .pop_due(now);
        let mut evicted = 0;

        for (_, id) in due {
            let Some(stored) = self.entities.get(&id) else {
                continue;
            };
            let Some(until) = entity::until_ms(&stored.entity) else {
                // Lifetime was cleared after scheduling.
                continue;
            };
            if until > now {
                // Lifetime was extended; the extending apply rescheduled it.
                continue;
            }
            let emitted = stored.expired_emitted;
            let snapshot = stored.entity.clone();
            drop(stored);

            if !emitted {
                if let Some(mut stored) = self.entities.get_mut(&id) {
                    stored.expired_emitted = true;
                }
                self.emit(ChangeKind::Expired, snapshot, now);
            }

            if until + self.grace_ms <= now {
                self.entities.remove(&id);
                evicted += 1;
                debug!(entity_id = %id, "Evicted expired entity");
            } else {
                self.expiry
                    .lock()
                    .expect("expiry lock poisoned")
                    .schedule(until + self.grace_ms, &id);
            }
        }

        evicted
    }

    /// Loads entities without broadcasting, for snapshot recovery before any
    /// subscriber exists.
    pub fn load_entities(&self, entities: Vec<Entity>) {
        let _guard = self.write.lock().expect("store write lock poisoned");
        let mut index = self.expiry.lock().expect("expiry lock poisoned");
        for mut loaded in entities {
            if loaded.id.is_empty() {
                warn!("Skipping persisted entity with empty id");
                continue;
            }
            entity::default_controller_node(&mut loaded, &self.node_id);
            if let Some(until) = entity::until_ms(&loaded) {
                index.schedule(until, &loaded.id);
            }
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            self.entities.insert(
                loaded.id.clone(),
                StoredEntity {
                    entity: loaded,
                    version,
                    expired_emitted: false,
                },
            );
        }
        info!(entities = self.entities.len(), "Loaded entity store");
    }

    fn emit(&self, kind: ChangeKind, merged: Entity, at_ms: i64) {
        let _ = self.change_tx.send(entity::change(kind, merged, at_ms));
    }
}

/// Background purge loop. Runs on a fixed cadence until cancelled.
pub fn spawn_purge(store: Arc<WorldStore>, interval: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let evicted = store.purge(entity::now_ms());
                    if evicted > 0 {
                        debug!(evicted, "Purge pass complete");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Purge loop stopped");
                    return;
                }
            }
        }
    });
}
