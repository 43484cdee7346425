use crate::entity::{self, change_priority, filter::CompiledFilter};
use crate::error::WorldError;
use crate::pb::{ChangeKind, EntityChange, StreamBehavior};
use crate::store::WorldStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

pub mod subscriber;
use subscriber::PendingQueue;


/// Outbound buffer per subscriber.
const SUBSCRIBER_BUFFER: usize = 64;

/// How long a full subscriber buffer is tolerated before disconnecting.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Far-future placeholder when nothing is scheduled.
const IDLE: Duration = Duration::from_secs(3600);

/// Fans entity change events out to subscribers. Each subscription runs in
/// its own task with its own broadcast receiver, filter, coalescing queue,
/// rate limiter, and keepalive timer; subscribers never share locks.
#[derive(Clone)]
pub struct ChangeBroker {
    store: Arc<WorldStore>,
}

impl ChangeBroker {
    pub fn new(store: Arc<WorldStore>) -> Self {
        Self { store }
    }

    /// Opens a subscription: an initial replay of every matching entity as
    /// `Updated`, then live events. The stream ends only when the receiver
    /// is dropped or the subscriber falls irrecoverably behind, in which
    /// case the final item is `Err(WorldError::Exhausted)` and the client
    /// is expected to reconnect for a fresh replay.
    pub fn watch(
        &self,
        filter: CompiledFilter,
        behavior: StreamBehavior,
    ) -> mpsc::Receiver<Result<EntityChange, WorldError>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        // Subscribe before returning so no event applied after this call is
        // missed; anything duplicated between the replay snapshot and the
        // live stream carries the same merged state.
        let changes = self.store.subscribe();
        let store = Arc::clone(&self.store);
        tokio::spawn(run_subscriber(store, changes, filter, behavior, tx));
        rx
    }
}

async fn run_subscriber(
    store: Arc<WorldStore>,
    mut changes: broadcast::Receiver<EntityChange>,
    filter: CompiledFilter,
    behavior: StreamBehavior,
    tx: mpsc::Sender<Result<EntityChange, WorldError>>,
) {
    let min_interval = behavior
        .max_rate_hz
        .filter(|hz| hz.is_finite() && *hz > 0.0)
        .map(|hz| Duration::from_secs_f64(1.0 / hz));
    let keepalive = behavior
        .keepalive_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    let min_priority = behavior.min_priority.unwrap_or(0);

    let mut pending = PendingQueue::new();
    let replay_at = entity::now_ms();
    for existing in store.list(&filter) {
        let event = entity::change(ChangeKind::Updated, existing, replay_at);
        if change_priority(event.kind()) >= min_priority {
            pending.push(event);
        }
    }
    debug!(replayed = pending.len(), "Watch subscriber started");

    let mut next_allowed = Instant::now();
    let mut last_activity = Instant::now();

    loop {
        let mut deadline = Instant::now() + IDLE;
        if !pending.is_empty() {
            deadline = deadline.min(next_allowed);
        }
        if let Some(interval) = keepalive {
            deadline = deadline.min(last_activity + interval);
        }

        tokio::select! {
            received = changes.recv() => match received {
                Ok(event) => {
                    if accepts(&filter, min_priority, &event) {
                        pending.push(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watch subscriber lagged, disconnecting");
                    let _ = tx.try_send(Err(WorldError::Exhausted));
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                if !pending.is_empty() && now >= next_allowed {
                    let event = pending.pop().expect("pending queue is non-empty");
                    if !deliver(&tx, event).await {
                        return;
                    }
                    last_activity = now;
                    if let Some(interval) = min_interval {
                        next_allowed = now + interval;
                    }
                } else if keepalive.is_some_and(|k| now >= last_activity + k) {
                    if !deliver(&tx, entity::keepalive(entity::now_ms())).await {
                        return;
                    }
                    last_activity = now;
                }
            }
        }
    }
}

fn accepts(filter: &CompiledFilter, min_priority: u32, event: &EntityChange) -> bool {
    if change_priority(event.kind()) < min_priority {
        return false;
    }
    match &event.entity {
        Some(entity) => filter.matches(entity),
        None => false,
    }
}

/// Sends one event, tolerating a full buffer up to `SEND_TIMEOUT`. Past
/// that, the subscriber is cut off with `resource-exhausted`.
async fn deliver(
    tx: &mpsc::Sender<Result<EntityChange, WorldError>>,
    event: EntityChange,
) -> bool {
    match tokio::time::timeout(SEND_TIMEOUT, tx.send(Ok(event))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            warn!("Watch subscriber buffer full, disconnecting");
            // Best effort: give the consumer one more window to pick up the
            // terminal error so it reconnects instead of seeing a bare EOF.
            let _ = tokio::time::timeout(SEND_TIMEOUT, tx.send(Err(WorldError::Exhausted))).await;
            false
        }
    }
}
