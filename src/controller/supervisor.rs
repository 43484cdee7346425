use super::{Connector, ConnectorContext};
use crate::client::{self, reconcile_with_retry};
use crate::controller::device;
use crate::entity;
use crate::pb::world_client::WorldClient;
use crate::pb::{Entity, Pairing, PairingKind};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Wait between restarts after a connector error.
    pub restart_backoff: Duration,
    /// Serialize connectors per device: while one pair holds a device,
    /// later pairs for the same device wait for the slot to end.
    pub exclusive_device: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(5),
            exclusive_device: false,
        }
    }
}

type PairKey = (String, String);

struct Slot {
    generation: u64,
    cancel: CancellationToken,
    config: Entity,
    device: Entity,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    channel: Channel,
    connector: Arc<dyn Connector>,
    options: SupervisorOptions,
    slots: Mutex<HashMap<PairKey, Slot>>,
    deferred: Mutex<HashMap<PairKey, (Entity, Entity)>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

/// Runs one connector per matched `(config, device)` pair, fed by the
/// engine's reconciliation stream.
///
/// Slots are generation-guarded: a connector that was superseded while
/// unwinding observes the generation mismatch on teardown and leaves the
/// replacement's slot alone. A replacement also awaits its predecessor's
/// task, so at most one connector is ever live per pair key.
pub struct ControllerSupervisor {
    shared: Arc<Shared>,
}

impl ControllerSupervisor {
    pub fn new(
        channel: Channel,
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                connector,
                options,
                slots: Mutex::new(HashMap::new()),
                deferred: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                cancel,
            }),
        }
    }

    /// Publishes the root device, then consumes the reconciliation stream
    /// until shutdown, driving connector lifecycles.
    pub async fn run(&self) -> Result<()> {
        let name = self.shared.connector.name().to_string();
        self.publish_root_device(&name).await;
        if self.shared.cancel.is_cancelled() {
            return Ok(());
        }

        let mut pairings = reconcile_with_retry(
            self.shared.channel.clone(),
            &name,
            self.shared.cancel.child_token(),
        );
        info!(controller = %name, "Controller supervisor running");

        loop {
            tokio::select! {
                pairing = pairings.recv() => match pairing {
                    Some(pairing) => self.shared.dispatch(pairing),
                    None => break,
                },
                _ = self.shared.cancel.cancelled() => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn publish_root_device(&self, name: &str) {
        let root = device::root_device(name, self.shared.connector.configurable());
        let mut client = WorldClient::new(self.shared.channel.clone());
        let mut backoff = client::INITIAL_BACKOFF;
        loop {
            match device::publish(&mut client, root.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(controller = %name, error = %e, "Root device publish failed, retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(client::jittered(backoff)) => {}
                _ = self.shared.cancel.cancelled() => return,
            }
            backoff = client::next_backoff(backoff);
        }
    }

    /// Cancels every connector and awaits their exit within the grace
    /// window.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.shared.slots.lock().expect("slot lock poisoned");
            slots
                .values_mut()
                .filter_map(|slot| {
                    slot.cancel.cancel();
                    slot.handle.take()
                })
                .collect()
        };
        for handle in handles {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
        debug!("Controller supervisor stopped");
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>, pairing: Pairing) {
        let kind = pairing.kind();
        let (Some(config), Some(device)) = (pairing.config, pairing.device) else {
            return;
        };
        let key = (config.id.clone(), device.id.clone());
        match kind {
            PairingKind::New | PairingKind::Changed => self.ensure(key, config, device),
            PairingKind::Removed => self.remove(&key),
            PairingKind::Unspecified => {}
        }
    }

    /// Starts (or restarts) the connector for a pair. An unchanged snapshot
    /// is left alone, so replays after a stream reconnect are no-ops.
    fn ensure(self: &Arc<Self>, key: PairKey, config: Entity, device: Entity) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");

        let predecessor = match slots.get_mut(&key) {
            Some(slot) => {
                if slot.config == config && slot.device == device {
                    return;
                }
                debug!(config = %key.0, device = %key.1, "Pair changed, restarting connector");
                slot.cancel.cancel();
                slot.handle.take()
            }
            None => None,
        };

        if self.options.exclusive_device && predecessor.is_none() {
            let device_busy = slots
                .iter()
                .any(|(other, _)| other.1 == key.1 && *other != key);
            if device_busy {
                debug!(config = %key.0, device = %key.1, "Device busy, deferring pair");
                self.deferred
                    .lock()
                    .expect("deferred lock poisoned")
                    .insert(key, (config, device));
                return;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.cancel.child_token();
        slots.insert(
            key.clone(),
            Slot {
                generation,
                cancel: token.clone(),
                config: config.clone(),
                device: device.clone(),
                handle: None,
            },
        );
        drop(slots);

        let handle = tokio::spawn(run_connector(
            Arc::clone(self),
            key.clone(),
            generation,
            token,
            config,
            device,
            predecessor,
        ));

        let mut slots = self.slots.lock().expect("slot lock poisoned");
        if let Some(slot) = slots.get_mut(&key) {
            if slot.generation == generation {
                slot.handle = Some(handle);
            }
        }
    }

    /// Cancels a removed pair's connector. The slot stays in the map until
    /// the connector's own teardown removes it, which keeps the exclusivity
    /// bookkeeping honest while it unwinds.
    fn remove(self: &Arc<Self>, key: &PairKey) {
        self.deferred
            .lock()
            .expect("deferred lock poisoned")
            .remove(key);
        let slots = self.slots.lock().expect("slot lock poisoned");
        if let Some(slot) = slots.get(key) {
            info!(config = %key.0, device = %key.1, "Pair removed, cancelling connector");
            slot.cancel.cancel();
        }
    }

    /// Hands a waiting pair the device freed by a finished slot.
    fn activate_deferred(self: &Arc<Self>, device_id: &str) {
        let next = {
            let mut deferred = self.deferred.lock().expect("deferred lock poisoned");
            let key = deferred
                .keys()
                .filter(|waiting| waiting.1 == device_id)
                .min()
                .cloned();
            key.map(|key| {
                let pair = deferred.remove(&key).expect("key taken from the map");
                (key, pair)
            })
        };
        if let Some((key, (config, device))) = next {
            debug!(config = %key.0, device = %key.1, "Starting deferred pair");
            self.ensure(key, config, device);
        }
    }
}

async fn run_connector(
    shared: Arc<Shared>,
    key: PairKey,
    generation: u64,
    token: CancellationToken,
    config: Entity,
    device: Entity,
    predecessor: Option<JoinHandle<()>>,
) {
    // At most one live connector per pair key: wait out the one we replace.
    if let Some(previous) = predecessor {
        let _ = previous.await;
    }

    // A configuration with a lifetime bounds its connector's scope.
    let deadline = entity::until_ms(&config).map(|until| {
        let remaining = (until - entity::now_ms()).max(0);
        tokio::time::Instant::now() + Duration::from_millis(remaining as u64)
    });
    let deadline_reached = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline_reached);

    info!(config = %key.0, device = %key.1, "Connector starting");

    loop {
        if token.is_cancelled() {
            break;
        }
        let ctx = ConnectorContext {
            world: WorldClient::new(shared.channel.clone()),
            cancel: token.clone(),
            config: config.clone(),
            device: device.clone(),
        };
        let attempt = shared.connector.run(ctx);
        tokio::pin!(attempt);

        let finished = tokio::select! {
            result = &mut attempt => Some(result),
            _ = token.cancelled() => None,
            _ = &mut deadline_reached => {
                debug!(config = %key.0, "Configuration lifetime reached, cancelling connector");
                token.cancel();
                None
            }
        };

        match finished {
            None => break,
            Some(Ok(())) => {
                debug!(config = %key.0, device = %key.1, "Connector finished");
                break;
            }
            Some(Err(e)) => {
                warn!(
                    config = %key.0,
                    device = %key.1,
                    error = %e,
                    "Connector failed, restarting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(shared.options.restart_backoff) => {}
                    _ = token.cancelled() => break,
                    _ = &mut deadline_reached => {
                        token.cancel();
                        break;
                    }
                }
            }
        }
    }

    finish_slot(&shared, &key, generation);
}

/// Slot teardown. Only the slot's own generation may delete the entry: a
/// superseded connector finds a newer generation here and leaves the
/// replacement's slot untouched.
fn finish_slot(shared: &Arc<Shared>, key: &PairKey, generation: u64) {
    {
        let mut slots = shared.slots.lock().expect("slot lock poisoned");
        match slots.get(key) {
            Some(slot) if slot.generation == generation => {
                slots.remove(key);
            }
            _ => return,
        }
    }
    if shared.options.exclusive_device {
        shared.activate_deferred(&key.1);
    }
}
