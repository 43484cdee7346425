use crate::entity;
use crate::pb::{ChangeKind, Entity, EntityChange, Pairing, PairingKind};
use crate::store::WorldStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod matcher;
use matcher::{is_candidate, pick_device, DeviceRecord};


const PAIRING_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct ReconcileState {
    configs: HashMap<String, Entity>,
    devices: HashMap<String, DeviceRecord>,
    /// config id -> device id, at most one device per configuration.
    pairs: HashMap<String, String>,
}

/// Mirrors configurations and devices off the change stream and maintains
/// the 1:1 pair table that feeds every controller's `Reconcile` stream.
///
/// Matching is sticky: an existing pair survives as long as the device
/// remains a candidate. A configuration that loses its device is rebound to
/// the longest-discovered remaining candidate, ties broken by device id.
pub struct Reconciler {
    state: Mutex<ReconcileState>,
    pair_tx: broadcast::Sender<Pairing>,
}

fn pairing(kind: PairingKind, config: &Entity, device: &Entity) -> Pairing {
    Pairing {
        kind: kind as i32,
        config: Some(config.clone()),
        device: Some(device.clone()),
    }
}

impl Reconciler {
    pub fn spawn(store: Arc<WorldStore>, cancel: CancellationToken) -> Arc<Self> {
        let (pair_tx, _) = broadcast::channel(PAIRING_CHANNEL_CAPACITY);
        let reconciler = Arc::new(Self {
            state: Mutex::new(ReconcileState::default()),
            pair_tx,
        });

        // Subscribe before seeding so nothing between the snapshot and the
        // live stream is missed; duplicated upserts are idempotent.
        let changes = store.subscribe();
        for existing in store.all_entities() {
            reconciler.upsert(existing);
        }
        info!("Reconciler seeded from the entity store");

        let task = Arc::clone(&reconciler);
        tokio::spawn(task.run(store, changes, cancel));
        reconciler
    }

    async fn run(
        self: Arc<Self>,
        store: Arc<WorldStore>,
        mut changes: broadcast::Receiver<EntityChange>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconciler lagged, resynchronizing from the store");
                        self.resync(store.all_entities());
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = cancel.cancelled() => {
                    debug!("Reconciler stopped");
                    return;
                }
            }
        }
    }

    fn handle_event(&self, event: &EntityChange) {
        let Some(target) = &event.entity else {
            return;
        };
        match event.kind() {
            ChangeKind::Updated => self.upsert(target.clone()),
            ChangeKind::Expired | ChangeKind::Unobserved => self.remove(&target.id),
            _ => {}
        }
    }

    /// Current pairs for one controller (as `New` events) plus a live
    /// receiver. Taken under the state lock so the replay and the stream
    /// line up without gaps.
    pub fn subscribe(&self, controller: &str) -> (Vec<Pairing>, broadcast::Receiver<Pairing>) {
        let state = self.state.lock().expect("reconcile lock poisoned");
        let rx = self.pair_tx.subscribe();

        let mut replay = Vec::new();
        for (config_id, device_id) in &state.pairs {
            let Some(config) = state.configs.get(config_id) else {
                continue;
            };
            if !config_controller_is(config, controller) {
                continue;
            }
            let Some(device) = state.devices.get(device_id) else {
                continue;
            };
            replay.push(pairing(PairingKind::New, config, &device.entity));
        }
        replay.sort_by(|a, b| {
            let a_id = a.config.as_ref().map(|c| c.id.as_str()).unwrap_or("");
            let b_id = b.config.as_ref().map(|c| c.id.as_str()).unwrap_or("");
            a_id.cmp(b_id)
        });
        (replay, rx)
    }

    fn upsert(&self, target: Entity) {
        let mut state = self.state.lock().expect("reconcile lock poisoned");
        let now = entity::now_ms();
        let id = target.id.clone();
        let mut out = Vec::new();

        // Device half of the entity.
        if target.device.is_some() {
            if let Some(record) = state.devices.get_mut(&id) {
                record.entity = target.clone();
                let bound: Vec<String> = state
                    .pairs
                    .iter()
                    .filter(|(_, device_id)| **device_id == id)
                    .map(|(config_id, _)| config_id.clone())
                    .collect();
                for config_id in bound {
                    Self::recompute(&mut state, &config_id, true, &mut out);
                }
            } else {
                state.devices.insert(
                    id.clone(),
                    DeviceRecord {
                        entity: target.clone(),
                        discovered_ms: now,
                    },
                );
            }
            // A device appearing or relabeling can satisfy waiting configs.
            let unmatched: Vec<String> = state
                .configs
                .keys()
                .filter(|config_id| !state.pairs.contains_key(*config_id))
                .cloned()
                .collect();
            for config_id in unmatched {
                Self::recompute(&mut state, &config_id, false, &mut out);
            }
        } else if state.devices.remove(&id).is_some() {
            Self::dissolve_device(&mut state, &id, None, &mut out);
        }

        // Config half of the entity.
        if target.config.is_some() {
            state.configs.insert(id.clone(), target.clone());
            Self::recompute(&mut state, &id, true, &mut out);
        } else if let Some(previous) = state.configs.remove(&id) {
            if let Some(device_id) = state.pairs.remove(&id) {
                let device = state
                    .devices
                    .get(&device_id)
                    .map(|record| record.entity.clone())
                    .unwrap_or_else(|| placeholder(&device_id));
                out.push(pairing(PairingKind::Removed, &previous, &device));
            }
        }

        // Emit under the state lock so subscribe() replays line up
        // gap-free with the live stream.
        self.emit(out);
        drop(state);
    }

    fn remove(&self, id: &str) {
        let mut state = self.state.lock().expect("reconcile lock poisoned");
        let mut out = Vec::new();

        if let Some(previous) = state.configs.remove(id) {
            if let Some(device_id) = state.pairs.remove(id) {
                let device = state
                    .devices
                    .get(&device_id)
                    .map(|record| record.entity.clone())
                    .unwrap_or_else(|| placeholder(&device_id));
                out.push(pairing(PairingKind::Removed, &previous, &device));
            }
        }

        if let Some(record) = state.devices.remove(id) {
            Self::dissolve_device(&mut state, id, Some(record.entity), &mut out);
        }

        // Emit under the state lock so subscribe() replays line up
        // gap-free with the live stream.
        self.emit(out);
        drop(state);
    }

    /// Drops every pair bound to a vanished device, then tries to rebind
    /// the orphaned configurations elsewhere.
    fn dissolve_device(
        state: &mut ReconcileState,
        device_id: &str,
        last_known: Option<Entity>,
        out: &mut Vec<Pairing>,
    ) {
        let bound: Vec<String> = state
            .pairs
            .iter()
            .filter(|(_, paired)| paired.as_str() == device_id)
            .map(|(config_id, _)| config_id.clone())
            .collect();
        let device = last_known.unwrap_or_else(|| placeholder(device_id));

        for config_id in bound {
            state.pairs.remove(&config_id);
            if let Some(config) = state.configs.get(&config_id).cloned() {
                out.push(pairing(PairingKind::Removed, &config, &device));
                Self::recompute(state, &config_id, false, out);
            }
        }
    }

    /// Re-evaluates one configuration's match. `notify_kept` controls
    /// whether an unchanged pair produces a `Changed` event (true when the
    /// config or its device was just updated).
    fn recompute(
        state: &mut ReconcileState,
        config_id: &str,
        notify_kept: bool,
        out: &mut Vec<Pairing>,
    ) {
        let Some(config_entity) = state.configs.get(config_id).cloned() else {
            return;
        };
        let Some(config) = config_entity.config.clone() else {
            return;
        };

        if let Some(device_id) = state.pairs.get(config_id).cloned() {
            let still_valid = state
                .devices
                .get(&device_id)
                .is_some_and(|record| is_candidate(&config, &record.entity));
            if still_valid {
                if notify_kept {
                    let device = state.devices[&device_id].entity.clone();
                    out.push(pairing(PairingKind::Changed, &config_entity, &device));
                }
                return;
            }
            let device = state
                .devices
                .get(&device_id)
                .map(|record| record.entity.clone())
                .unwrap_or_else(|| placeholder(&device_id));
            state.pairs.remove(config_id);
            out.push(pairing(PairingKind::Removed, &config_entity, &device));
        }

        let picked: Option<String> = pick_device(
            state
                .devices
                .iter()
                .filter(|(_, record)| is_candidate(&config, &record.entity))
                .map(|(id, record)| (id.as_str(), record)),
        )
        .map(str::to_string);

        if let Some(device_id) = picked {
            let device = state.devices[&device_id].entity.clone();
            state.pairs.insert(config_id.to_string(), device_id);
            out.push(pairing(PairingKind::New, &config_entity, &device));
        }
    }

    /// Full rebuild after the reconciler fell behind the change stream.
    /// Pairs that survive the rebuild surface as `Changed` (supervisors
    /// compare snapshots and no-op when nothing moved); dropped pairs
    /// surface as `Removed`, new ones as `New`.
    fn resync(&self, entities: Vec<Entity>) {
        let mut state = self.state.lock().expect("reconcile lock poisoned");
        let now = entity::now_ms();
        let old_pairs = std::mem::take(&mut state.pairs);
        let old_devices = std::mem::take(&mut state.devices);
        let old_configs = std::mem::take(&mut state.configs);
        let mut out = Vec::new();

        for target in entities {
            if target.device.is_some() {
                let discovered_ms = old_devices
                    .get(&target.id)
                    .map(|record| record.discovered_ms)
                    .unwrap_or(now);
                state.devices.insert(
                    target.id.clone(),
                    DeviceRecord {
                        entity: target.clone(),
                        discovered_ms,
                    },
                );
            }
            if target.config.is_some() {
                state.configs.insert(target.id.clone(), target);
            }
        }

        let config_ids: Vec<String> = state.configs.keys().cloned().collect();
        for config_id in config_ids {
            Self::recompute(&mut state, &config_id, false, &mut out);
        }

        // Rewrite freshly recomputed pairs that already existed as Changed.
        for event in &mut out {
            if event.kind() == PairingKind::New {
                let config_id = event.config.as_ref().map(|c| c.id.clone()).unwrap_or_default();
                let device_id = event.device.as_ref().map(|d| d.id.clone()).unwrap_or_default();
                if old_pairs.get(&config_id) == Some(&device_id) {
                    event.kind = PairingKind::Changed as i32;
                }
            }
        }

        // Pairs that did not survive the rebuild (dropped or rebound).
        for (config_id, device_id) in old_pairs {
            if state.pairs.get(&config_id) != Some(&device_id) {
                let config = old_configs
                    .get(&config_id)
                    .cloned()
                    .unwrap_or_else(|| placeholder(&config_id));
                let device = old_devices
                    .get(&device_id)
                    .map(|record| record.entity.clone())
                    .unwrap_or_else(|| placeholder(&device_id));
                out.push(pairing(PairingKind::Removed, &config, &device));
            }
        }

        // Emit under the state lock so subscribe() replays line up
        // gap-free with the live stream.
        self.emit(out);
        drop(state);
    }

    fn emit(&self, events: Vec<Pairing>) {
        for event in events {
            let _ = self.pair_tx.send(event);
        }
    }
}

fn config_controller_is(config: &Entity, controller: &str) -> bool {
    config
        .config
        .as_ref()
        .is_some_and(|c| c.controller == controller)
}

fn placeholder(id: &str) -> Entity {
    Entity {
        id: id.to_string(),
        ..Default::default()
    }
}

/// Filters a pairing stream down to one controller's pairs.
pub fn pairing_is_for(event: &Pairing, controller: &str) -> bool {
    event
        .config
        .as_ref()
        .is_some_and(|config| config_controller_is(config, controller))
}
