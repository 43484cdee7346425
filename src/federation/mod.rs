use crate::client;
use crate::controller::{Connector, ConnectorContext};
use crate::entity::{self, component};
use crate::pb::world_client::WorldClient;
use crate::pb::{
    ChangeKind, Configurable, Entity, EntityChange, GetLocalNodeRequest, PushRequest,
    StreamBehavior, WatchEntitiesRequest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};


/// Controller name federation registers under.
pub const CONTROLLER_NAME: &str = "federation";

/// The configuration key a federation peer binding uses.
pub const PEER_CONFIG_KEY: &str = "federation.peer.v0";

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline on each outbound push to a peer.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON schema advertised for `federation.peer.v0` values.
const PEER_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["mode", "endpoint"],
  "properties": {
    "mode": {"enum": ["push", "pull"]},
    "endpoint": {"type": "string"},
    "filter": {"type": "object"},
    "max_rate_hz": {"type": "number"},
    "keepalive_interval_ms": {"type": "integer"},
    "tunnel": {"type": "object"}
  }
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Replicate local changes to the remote peer.
    Push,
    /// Replicate the remote peer's changes into the local store.
    Pull,
}

/// One federation instance, declared as the JSON value of a
/// `federation.peer.v0` configuration entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSpec {
    pub mode: Mode,
    pub endpoint: String,
    #[serde(default)]
    pub filter: Option<crate::pb::EntityFilter>,
    #[serde(default)]
    pub max_rate_hz: Option<f64>,
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,
    #[serde(default)]
    pub tunnel: Option<TunnelSpec>,
}

/// Encrypted-tunnel parameters. Parsed and handed to the dialer; the
/// in-tree dialer is direct, tunnel transports plug in from the host shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub private_key: String,
    pub peer_public_key: String,
    pub endpoint: String,
    pub local_address: String,
}

/// Seam between federation and the transport used to reach a peer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, endpoint: &str, tunnel: Option<&TunnelSpec>) -> Result<Channel>;
}

/// Plain TCP dialing; long-lived channels re-resolve the endpoint hostname
/// on every reconnect.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, endpoint: &str, tunnel: Option<&TunnelSpec>) -> Result<Channel> {
        if tunnel.is_some() {
            warn!(endpoint = %endpoint, "Tunnel configured but no tunnel transport linked, dialing direct");
        }
        let channel = Endpoint::try_from(endpoint.to_string())
            .with_context(|| format!("bad federation endpoint '{endpoint}'"))?
            .connect_timeout(DIAL_TIMEOUT)
            .connect()
            .await
            .with_context(|| format!("dialing federation peer '{endpoint}'"))?;
        Ok(channel)
    }
}

/// The federation controller: every matched `federation.peer.v0`
/// configuration runs one replication instance against the engine's own
/// loopback channel.
pub struct FederationConnector {
    dialer: Arc<dyn Dialer>,
}

impl FederationConnector {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

impl Default for FederationConnector {
    fn default() -> Self {
        Self::new(Arc::new(DirectDialer))
    }
}

#[async_trait]
impl Connector for FederationConnector {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    fn configurable(&self) -> Vec<Configurable> {
        vec![Configurable {
            key: PEER_CONFIG_KEY.to_string(),
            schema: Some(PEER_SCHEMA.to_string()),
        }]
    }

    async fn run(&self, ctx: ConnectorContext) -> Result<()> {
        let value = ctx
            .config
            .config
            .as_ref()
            .map(|config| config.value.clone())
            .unwrap_or_default();
        let spec: PeerSpec =
            serde_json::from_str(&value).context("parsing federation peer spec")?;

        // Transient failures never kill the instance, only its current
        // attempt; each attempt re-dials so DNS changes are picked up.
        let mut backoff = client::INITIAL_BACKOFF;
        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            match run_instance(&ctx, &spec, self.dialer.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        endpoint = %spec.endpoint,
                        error = %e,
                        "Federation attempt failed, backing off"
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(client::jittered(backoff)) => {}
                _ = ctx.cancel.cancelled() => return Ok(()),
            }
            backoff = client::next_backoff(backoff);
        }
    }
}

async fn run_instance(ctx: &ConnectorContext, spec: &PeerSpec, dialer: &dyn Dialer) -> Result<()> {
    let remote_channel = dialer.dial(&spec.endpoint, spec.tunnel.as_ref()).await?;
    let mut local = ctx.world.clone();
    let mut remote = WorldClient::new(remote_channel);

    let local_node = node_id_of(&mut local).await.context("local GetLocalNode")?;
    let remote_node = node_id_of(&mut remote).await.context("remote GetLocalNode")?;
    info!(
        mode = ?spec.mode,
        endpoint = %spec.endpoint,
        local_node = %local_node,
        remote_node = %remote_node,
        "Federation connected"
    );

    // Exclude configuration entities at the source; the admission check in
    // `replicable` still backstops the stream.
    let mut filter = spec.filter.clone().unwrap_or_default();
    if !filter.without_components.contains(&component::CONFIG) {
        filter.without_components.push(component::CONFIG);
    }

    let request = WatchEntitiesRequest {
        filter: Some(filter),
        behavior: Some(StreamBehavior {
            max_rate_hz: spec.max_rate_hz,
            min_priority: None,
            keepalive_interval_ms: spec.keepalive_interval_ms,
        }),
    };

    // The sink never receives entities that originated at its own node.
    match spec.mode {
        Mode::Push => replicate(local, remote, request, &remote_node, &ctx.cancel).await,
        Mode::Pull => replicate(remote, local, request, &local_node, &ctx.cancel).await,
    }
}

async fn node_id_of(client: &mut WorldClient<Channel>) -> Result<String> {
    let response = client.get_local_node(GetLocalNodeRequest {}).await?;
    let node = response
        .into_inner()
        .node
        .context("peer returned no node entity")?;
    let node_id = node
        .controller
        .as_ref()
        .map(|controller| controller.node.clone())
        .unwrap_or_default();
    anyhow::ensure!(!node_id.is_empty(), "peer node entity has no node id");
    Ok(node_id)
}

/// Watches `source` and forwards replicable events to `sink` until the
/// stream ends or an error surfaces to the retry loop above.
async fn replicate(
    mut source: WorldClient<Channel>,
    mut sink: WorldClient<Channel>,
    request: WatchEntitiesRequest,
    sink_node: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut stream = source
        .watch_entities(request)
        .await
        .context("opening federation watch")?
        .into_inner();

    loop {
        tokio::select! {
            message = stream.message() => match message {
                Ok(Some(event)) => {
                    let Some(target) = replicable(event, sink_node) else {
                        continue;
                    };
                    let entity_id = target.id.clone();
                    let response = tokio::time::timeout(
                        PUSH_TIMEOUT,
                        sink.push(PushRequest {
                            entities: vec![target],
                        }),
                    )
                    .await
                    .context("federation push deadline exceeded")?
                    .context("pushing to federation sink")?
                    .into_inner();
                    if !response.accepted {
                        // Policy rejection at the sink is not transient.
                        debug!(entity_id = %entity_id, "Federation push rejected by sink");
                    }
                }
                Ok(None) => return Ok(()),
                Err(status) => anyhow::bail!("federation watch stream: {status}"),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Replication admission: only real change events, never configuration
/// entities, never non-expiring entities (a missed delete would leak them
/// forever), and never entities originated by the sink node itself.
fn replicable(event: EntityChange, sink_node: &str) -> Option<Entity> {
    match event.kind() {
        ChangeKind::Updated | ChangeKind::Expired | ChangeKind::Unobserved => {}
        _ => return None,
    }
    let target = event.entity?;
    if target.config.is_some() {
        return None;
    }
    entity::until_ms(&target)?;
    if let Some(controller) = &target.controller {
        if controller.node == sink_node {
            return None;
        }
    }
    Some(target)
}
