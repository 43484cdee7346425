use crate::pb::world_client::WorldClient;
use crate::pb::{Configurable, Entity};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

pub mod device;
pub mod supervisor;

pub use supervisor::{ControllerSupervisor, SupervisorOptions};

/// Everything a connector attempt gets to work with. The world client rides
/// the controller's channel (loopback for co-hosted controllers); the
/// cancellation token covers pair removal, configuration lifetime
/// deadlines, and engine shutdown alike.
#[derive(Clone)]
pub struct ConnectorContext {
    pub world: WorldClient<Channel>,
    pub cancel: CancellationToken,
    pub config: Entity,
    pub device: Entity,
}

/// A controller's per-pair workhorse.
///
/// The supervisor runs one connector per matched `(config, device)` pair:
/// started on `New`, restarted when the pair's snapshot changes or `run`
/// returns an error, cancelled on `Removed`.
///
/// # Lifecycle
/// 1. The controller publishes its root device advertising `configurable()`
/// 2. Users push configuration entities naming the controller and a key
/// 3. The engine matches pairs and streams them over `Reconcile`
/// 4. The supervisor calls `run` for each pair; entity changes flow back
///    into the engine through `ctx.world`
///
/// `run` should return promptly once `ctx.cancel` fires; an `Err` return
/// means the connector will be restarted after a fixed backoff for as long
/// as the pair still matches.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Controller name; matches `controller.id` on published devices and
    /// `config.controller` on configurations.
    fn name(&self) -> &str;

    /// Configuration schemas this controller accepts, advertised on its
    /// root device.
    fn configurable(&self) -> Vec<Configurable>;

    /// Reconciles one `(config, device)` pair with the external world.
    async fn run(&self, ctx: ConnectorContext) -> anyhow::Result<()>;
}
