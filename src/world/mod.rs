use crate::broker::ChangeBroker;
use crate::entity::{self, filter::CompiledFilter};
use crate::error::WorldError;
use crate::node::NodeIdentity;
use crate::pb::{
    Entity, EntityChange, EntityFilter, Pairing, PushOutcome, PushResponse, StreamBehavior,
};
use crate::policy::{Action, Peer, PolicyGate, PolicyInput};
use crate::reconcile::{pairing_is_for, Reconciler};
use crate::store::WorldStore;
use crate::timeline::TimelineBuffer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub mod task;
pub use task::Taskable;

#[cfg(test)]
mod tests;

const RECONCILE_BUFFER: usize = 64;

/// The world service semantics, implemented once. The gRPC service and the
/// JSON bridge are thin edges over this; both hand in the caller's peer
/// identity and every operation passes the policy gate.
pub struct WorldCore {
    store: Arc<WorldStore>,
    broker: ChangeBroker,
    timeline: Arc<TimelineBuffer>,
    policy: Arc<PolicyGate>,
    reconciler: Arc<Reconciler>,
    node: NodeIdentity,
    taskables: Mutex<HashMap<String, Arc<dyn Taskable>>>,
}

impl WorldCore {
    pub fn new(
        store: Arc<WorldStore>,
        timeline: Arc<TimelineBuffer>,
        policy: Arc<PolicyGate>,
        reconciler: Arc<Reconciler>,
        node: NodeIdentity,
    ) -> Self {
        let broker = ChangeBroker::new(Arc::clone(&store));
        Self {
            store,
            broker,
            timeline,
            policy,
            reconciler,
            node,
            taskables: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<WorldStore> {
        &self.store
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    /// Applies partial entities in order. Each entity is admitted or
    /// rejected independently; a policy rejection reports its reason and
    /// never mutates state.
    pub fn push(&self, peer: Peer, entities: Vec<Entity>) -> PushResponse {
        let mut outcomes = Vec::with_capacity(entities.len());
        for partial in entities {
            let entity_id = partial.id.clone();
            let outcome = self
                .admit_write(peer, &partial)
                .and_then(|()| self.store.apply(partial));
            match outcome {
                Ok(_) => outcomes.push(PushOutcome {
                    entity_id,
                    accepted: true,
                    reason: None,
                }),
                Err(err) => {
                    debug!(entity_id = %entity_id, error = %err, "Push rejected");
                    outcomes.push(PushOutcome {
                        entity_id,
                        accepted: false,
                        reason: Some(err.to_string()),
                    });
                }
            }
        }
        PushResponse {
            accepted: outcomes.iter().all(|outcome| outcome.accepted),
            outcomes,
        }
    }

    pub fn get(&self, peer: Peer, id: &str) -> Result<Entity, WorldError> {
        self.check(Action::Read, peer, Some((id, 0)))?;
        self.store
            .get(id)
            .ok_or_else(|| WorldError::NotFound(id.to_string()))
    }

    pub fn list(&self, peer: Peer, filter: Option<EntityFilter>) -> Result<Vec<Entity>, WorldError> {
        self.check(Action::Read, peer, None)?;
        let compiled = CompiledFilter::compile(filter)?;
        Ok(self.store.list(&compiled))
    }

    /// Initial replay plus live change events, shaped by the subscriber's
    /// filter and behavior.
    pub fn watch(
        &self,
        peer: Peer,
        filter: Option<EntityFilter>,
        behavior: Option<StreamBehavior>,
    ) -> Result<mpsc::Receiver<Result<EntityChange, WorldError>>, WorldError> {
        self.check(Action::Read, peer, None)?;
        let compiled = CompiledFilter::compile(filter)?;
        Ok(self.broker.watch(compiled, behavior.unwrap_or_default()))
    }

    pub fn expire(&self, peer: Peer, id: &str) -> Result<(), WorldError> {
        self.check(Action::Write, peer, Some((id, 0)))?;
        self.store.expire(id)
    }

    pub fn mark_unobserved(&self, peer: Peer, id: &str) -> Result<(), WorldError> {
        self.check(Action::Write, peer, Some((id, 0)))?;
        self.store.mark_unobserved(id)
    }

    pub async fn run_task(&self, peer: Peer, id: &str) -> Result<String, WorldError> {
        self.check(Action::Write, peer, Some((id, 0)))?;
        let taskable = self
            .taskables
            .lock()
            .expect("taskable lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| WorldError::NotFound(format!("no taskable for entity '{id}'")))?;
        taskable.run().await.map_err(WorldError::Internal)
    }

    pub fn register_taskable(&self, entity_id: &str, taskable: Arc<dyn Taskable>) {
        self.taskables
            .lock()
            .expect("taskable lock poisoned")
            .insert(entity_id.to_string(), taskable);
    }

    pub fn local_node(&self, peer: Peer) -> Result<Entity, WorldError> {
        self.check(Action::Read, peer, None)?;
        Ok(self
            .store
            .get(&self.node.entity_id())
            .unwrap_or_else(|| self.node.entity()))
    }

    /// The reconciliation stream for one controller: current pairs replayed
    /// as `New`, then live pairing deltas.
    pub fn reconcile(
        &self,
        peer: Peer,
        controller: &str,
    ) -> Result<mpsc::Receiver<Result<Pairing, WorldError>>, WorldError> {
        self.check(Action::Read, peer, None)?;
        if controller.is_empty() {
            return Err(WorldError::Validation("controller name must not be empty".into()));
        }

        let (replay, mut pairings) = self.reconciler.subscribe(controller);
        let (tx, rx) = mpsc::channel(RECONCILE_BUFFER);
        let controller = controller.to_string();
        tokio::spawn(async move {
            for event in replay {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            loop {
                match pairings.recv().await {
                    Ok(event) => {
                        if !pairing_is_for(&event, &controller) {
                            continue;
                        }
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, controller = %controller, "Reconcile stream lagged");
                        let _ = tx.try_send(Err(WorldError::Exhausted));
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    pub fn timeline(
        &self,
        peer: Peer,
        seek_unix_ms: Option<i64>,
    ) -> Result<mpsc::Receiver<Result<EntityChange, WorldError>>, WorldError> {
        self.check(Action::Timeline, peer, None)?;
        Ok(self.timeline.stream(seek_unix_ms))
    }

    pub fn move_timeline(
        &self,
        peer: Peer,
        freeze: bool,
        at_unix_ms: Option<i64>,
    ) -> Result<(), WorldError> {
        self.check(Action::Timeline, peer, None)?;
        self.timeline.move_to(freeze, at_unix_ms);
        Ok(())
    }

    /// Write admission for one entity: shape validation, then policy.
    fn admit_write(&self, peer: Peer, partial: &Entity) -> Result<(), WorldError> {
        entity::validate(partial)?;
        if let Some(config) = &partial.config {
            if config.controller.is_empty() {
                return Err(WorldError::Validation(
                    "config component needs a controller name".into(),
                ));
            }
            if config.key.is_empty() {
                return Err(WorldError::Validation(
                    "config component needs a key".into(),
                ));
            }
        }
        let decision = self.policy.evaluate(&PolicyInput {
            action: Action::Write,
            peer,
            entity_id: Some(&partial.id),
            components: entity::component_bitmap(partial),
        });
        if decision.allowed {
            Ok(())
        } else {
            Err(WorldError::PolicyDenied {
                action: Action::Write.as_str(),
                entity: partial.id.clone(),
            })
        }
    }

    fn check(
        &self,
        action: Action,
        peer: Peer,
        entity: Option<(&str, u32)>,
    ) -> Result<(), WorldError> {
        let decision = self.policy.evaluate(&PolicyInput {
            action,
            peer,
            entity_id: entity.map(|(id, _)| id),
            components: entity.map(|(_, bits)| bits).unwrap_or(0),
        });
        if decision.allowed {
            Ok(())
        } else {
            Err(WorldError::PolicyDenied {
                action: action.as_str(),
                entity: entity.map(|(id, _)| id).unwrap_or("*").to_string(),
            })
        }
    }
}
