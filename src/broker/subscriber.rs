use crate::pb::{ChangeKind, EntityChange};
use std::collections::{HashMap, VecDeque};

/// Per-subscriber pending events: delivery order across entities plus a
/// per-id slot that coalesces bursts.
///
/// Coalescing rules: a newer `Updated` replaces a pending `Updated` for the
/// same entity; `Expired`/`Unobserved` supersede a pending `Updated` and are
/// never replaced by one — an `Updated` arriving after a pending terminal
/// event queues behind it so per-entity order is preserved.
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: VecDeque<String>,
    slots: HashMap<String, VecDeque<EntityChange>>,
}

fn is_terminal(kind: ChangeKind) -> bool {
    matches!(kind, ChangeKind::Expired | ChangeKind::Unobserved)
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: EntityChange) {
        let Some(id) = event.entity.as_ref().map(|e| e.id.clone()) else {
            return;
        };
        let slot = self.slots.entry(id.clone()).or_default();
        if slot.is_empty() {
            self.order.push_back(id);
        }
        match slot.back_mut() {
            Some(last) if !is_terminal(last.kind()) => {
                // Pending update: latest state (or a terminal event) wins.
                *last = event;
            }
            Some(last) if is_terminal(event.kind()) => {
                // Terminal over terminal: keep the latest signal.
                *last = event;
            }
            Some(_) => {
                // Update after a pending terminal event: deliver both, in order.
                slot.push_back(event);
            }
            None => slot.push_back(event),
        }
    }

    pub fn pop(&mut self) -> Option<EntityChange> {
        let id = self.order.pop_front()?;
        let slot = self.slots.get_mut(&id)?;
        let event = slot.pop_front();
        if slot.is_empty() {
            self.slots.remove(&id);
        } else {
            self.order.push_back(id);
        }
        event
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.values().map(VecDeque::len).sum()
    }
}
