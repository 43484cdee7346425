use crate::entity;
use crate::error::WorldError;
use crate::pb::{ChangeKind, EntityChange};
use crate::store::WorldStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 64;

/// Bounded ring of recent change events for UI scrubbing. Not authoritative
/// state: overflow discards the oldest events and nothing is persisted.
pub struct TimelineBuffer {
    ring: Mutex<VecDeque<(u64, EntityChange)>>,
    window_ms: i64,
    max_events: usize,
    next_seq: AtomicU64,
    head_tx: watch::Sender<u64>,
    /// `Some(at)` while frozen; `at` is the scrub position in unix ms.
    frozen_tx: watch::Sender<Option<i64>>,
}

impl TimelineBuffer {
    pub fn new(window_ms: i64, max_events: usize) -> Arc<Self> {
        let (head_tx, _) = watch::channel(0);
        let (frozen_tx, _) = watch::channel(None);
        Arc::new(Self {
            ring: Mutex::new(VecDeque::new()),
            window_ms,
            max_events,
            next_seq: AtomicU64::new(0),
            head_tx,
            frozen_tx,
        })
    }

    /// Follows the store's change stream into the ring. The timeline is a
    /// best-effort log, so a lagged receiver just keeps going.
    pub fn spawn_collector(self: &Arc<Self>, store: &WorldStore, cancel: CancellationToken) {
        let buffer = Arc::clone(self);
        let mut changes = store.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(event) => buffer.append(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Timeline collector lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = cancel.cancelled() => {
                        debug!("Timeline collector stopped");
                        return;
                    }
                }
            }
        });
    }

    fn append(&self, event: EntityChange) {
        if event.kind() == ChangeKind::Keepalive {
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut ring = self.ring.lock().expect("timeline lock poisoned");
            ring.push_back((seq, event));
            let horizon = entity::now_ms() - self.window_ms;
            while ring.len() > self.max_events
                || ring.front().is_some_and(|(_, e)| e.observed_unix_ms < horizon)
            {
                ring.pop_front();
            }
        }
        let _ = self.head_tx.send(seq);
    }

    /// Freezes or resumes timeline delivery. While frozen, subscribers only
    /// receive ring events up to the scrub position `at` (default: the
    /// freeze instant); unfreezing resumes live delivery from wherever the
    /// scrub position ended up.
    pub fn move_to(&self, freeze: bool, at: Option<i64>) {
        let state = freeze.then(|| at.unwrap_or_else(entity::now_ms));
        let _ = self.frozen_tx.send(state);
        debug!(?state, "Timeline moved");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen_tx.borrow().is_some()
    }

    /// Streams the ring from `seek` (unix ms, default: everything buffered)
    /// and then follows live appends, honoring the freeze state.
    pub fn stream(
        self: &Arc<Self>,
        seek: Option<i64>,
    ) -> mpsc::Receiver<Result<EntityChange, WorldError>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            buffer.run_stream(seek, tx).await;
        });
        rx
    }

    async fn run_stream(
        &self,
        seek: Option<i64>,
        tx: mpsc::Sender<Result<EntityChange, WorldError>>,
    ) {
        let mut head_rx = self.head_tx.subscribe();
        let mut frozen_rx = self.frozen_tx.subscribe();
        let mut last_seq = match seek {
            Some(at) => self.seq_before(at),
            None => 0,
        };

        loop {
            let limit = *frozen_rx.borrow_and_update();
            if let Some(at) = limit {
                // Scrubbing backwards rewinds the cursor for re-delivery.
                let rewound = self.seq_before(at + 1);
                if rewound < last_seq {
                    last_seq = rewound;
                }
            }

            let batch = self.collect_after(last_seq, limit);
            for (seq, event) in batch {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
                last_seq = seq;
            }

            tokio::select! {
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = frozen_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Sequence of the newest event strictly before `at`, or 0.
    fn seq_before(&self, at: i64) -> u64 {
        let ring = self.ring.lock().expect("timeline lock poisoned");
        ring.iter()
            .take_while(|(_, e)| e.observed_unix_ms < at)
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(0)
    }

    fn collect_after(&self, last_seq: u64, limit: Option<i64>) -> Vec<(u64, EntityChange)> {
        let ring = self.ring.lock().expect("timeline lock poisoned");
        ring.iter()
            .filter(|(seq, event)| {
                *seq > last_seq && limit.map_or(true, |at| event.observed_unix_ms <= at)
            })
            .map(|(seq, event)| (*seq, event.clone()))
            .collect()
    }
}
