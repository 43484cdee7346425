//! Client-side helpers for consuming the engine's server-side streams.
//!
//! Any stream (watch, reconcile, timeline) can end with a restartable
//! status; consumers re-dial with the same parameters and bounded backoff
//! instead of treating it as terminal.

use crate::pb::world_client::WorldClient;
use crate::pb::{EntityChange, Pairing, ReconcileRequest, WatchEntitiesRequest};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const STREAM_BUFFER: usize = 64;

/// Stream errors worth a reconnect; everything else (and EOF) is terminal.
pub fn is_restartable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::ResourceExhausted | Code::Aborted | Code::Internal | Code::Unknown
    )
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Up to 25% random extension so restarting clients don't stampede.
pub fn jittered(base: Duration) -> Duration {
    base + base.mul_f64(rand::random::<f64>() * 0.25)
}

/// `WatchEntities` behind the re-dialing wrapper: the receiver sees one
/// uninterrupted event stream; replays after a reconnect simply re-deliver
/// current state.
pub fn watch_with_retry(
    channel: Channel,
    request: WatchEntitiesRequest,
    cancel: CancellationToken,
) -> mpsc::Receiver<EntityChange> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut client = WorldClient::new(channel.clone());
            let attempt = client.watch_entities(request.clone()).await;
            match attempt {
                Ok(response) => {
                    let mut stream = response.into_inner();
                    loop {
                        tokio::select! {
                            message = stream.message() => match message {
                                Ok(Some(event)) => {
                                    backoff = INITIAL_BACKOFF;
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => return,
                                Err(status) if is_restartable(&status) => {
                                    warn!(status = %status, "Watch stream interrupted, reconnecting");
                                    break;
                                }
                                Err(status) => {
                                    debug!(status = %status, "Watch stream ended");
                                    return;
                                }
                            },
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
                Err(status) if is_restartable(&status) => {
                    warn!(status = %status, "Watch connect failed, retrying");
                }
                Err(status) => {
                    debug!(status = %status, "Watch connect rejected");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(jittered(backoff)) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = next_backoff(backoff);
        }
    });
    rx
}

/// `Reconcile` behind the same re-dialing wrapper. After a reconnect the
/// engine replays current pairs as `New`; supervisors compare snapshots, so
/// replayed pairs are harmless.
pub fn reconcile_with_retry(
    channel: Channel,
    controller: &str,
    cancel: CancellationToken,
) -> mpsc::Receiver<Pairing> {
    let request = ReconcileRequest {
        controller: controller.to_string(),
    };
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut client = WorldClient::new(channel.clone());
            let attempt = client.reconcile(request.clone()).await;
            match attempt {
                Ok(response) => {
                    let mut stream = response.into_inner();
                    loop {
                        tokio::select! {
                            message = stream.message() => match message {
                                Ok(Some(pairing)) => {
                                    backoff = INITIAL_BACKOFF;
                                    if tx.send(pairing).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => return,
                                Err(status) if is_restartable(&status) => {
                                    warn!(status = %status, "Reconcile stream interrupted, reconnecting");
                                    break;
                                }
                                Err(status) => {
                                    debug!(status = %status, "Reconcile stream ended");
                                    return;
                                }
                            },
                            _ = cancel.cancelled() => return,
                        }
                    }
                }
                Err(status) if is_restartable(&status) => {
                    warn!(status = %status, "Reconcile connect failed, retrying");
                }
                Err(status) => {
                    debug!(status = %status, "Reconcile connect rejected");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(jittered(backoff)) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = next_backoff(backoff);
        }
    });
    rx
}
