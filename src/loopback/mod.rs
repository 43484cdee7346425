use crate::pb::world_server::WorldServer;
use crate::rpc::WorldService;
use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tracing::{debug, error, info};

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-process RPC channel for co-hosted controllers. The full tonic stack
/// runs over in-memory duplex pipes, so the loopback behaves like a real
/// transport but never leaves the process — and its requests carry no
/// socket address, which is the identity the policy gate exempts. External
/// TCP connections to localhost are ordinary remote callers.
pub struct LoopbackTransport {
    connections: mpsc::UnboundedSender<DuplexStream>,
}

impl LoopbackTransport {
    /// Serves `service` on an in-memory listener until cancelled.
    pub fn spawn(service: WorldServer<WorldService>, cancel: CancellationToken) -> Self {
        let (connections, accepted) = mpsc::unbounded_channel::<DuplexStream>();
        let incoming = UnboundedReceiverStream::new(accepted).map(Ok::<_, io::Error>);

        tokio::spawn(async move {
            let served = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
                .await;
            match served {
                Ok(()) => debug!("Loopback transport stopped"),
                Err(e) => error!(error = %e, "Loopback transport failed"),
            }
        });
        info!("Loopback transport started");

        Self { connections }
    }

    /// Opens a client channel. Every (re)connection of the channel mints a
    /// fresh duplex pipe to the in-memory listener.
    pub async fn channel(&self) -> Result<Channel> {
        let connections = self.connections.clone();
        let channel = Endpoint::try_from("http://world.loopback")
            .context("loopback endpoint uri")?
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let connections = connections.clone();
                async move {
                    let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
                    connections.send(server).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            "loopback transport stopped",
                        )
                    })?;
                    Ok::<_, io::Error>(TokioIo::new(client))
                }
            }))
            .await
            .context("connecting loopback channel")?;
        Ok(channel)
    }
}
