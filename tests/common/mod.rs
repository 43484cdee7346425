#![allow(dead_code)]

use hydris::loopback::LoopbackTransport;
use hydris::node::NodeIdentity;
use hydris::pb::world_client::WorldClient;
use hydris::pb::{Entity, Geo, Lifetime, PushRequest};
use hydris::policy::PolicyGate;
use hydris::reconcile::Reconciler;
use hydris::rpc::WorldService;
use hydris::store::WorldStore;
use hydris::timeline::TimelineBuffer;
use hydris::world::WorldCore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// A complete in-process engine served over the loopback transport.
pub struct TestEngine {
    pub core: Arc<WorldCore>,
    pub loopback: LoopbackTransport,
    pub cancel: CancellationToken,
    pub node_id: String,
}

pub async fn boot() -> TestEngine {
    boot_with_policy(PolicyGate::permissive()).await
}

pub async fn boot_with_policy(policy: PolicyGate) -> TestEngine {
    let node = NodeIdentity::restore_or_create(None);
    let node_id = node.node_id.clone();
    let cancel = CancellationToken::new();

    let store = Arc::new(WorldStore::new(&node_id, 5_000));
    store.apply(node.entity()).expect("publishing node entity");

    let timeline = TimelineBuffer::new(300_000, 4_096);
    timeline.spawn_collector(&store, cancel.child_token());
    let reconciler = Reconciler::spawn(Arc::clone(&store), cancel.child_token());

    let core = Arc::new(WorldCore::new(
        store,
        timeline,
        Arc::new(policy),
        reconciler,
        node,
    ));
    let loopback = LoopbackTransport::spawn(
        WorldService::server(Arc::clone(&core)),
        cancel.child_token(),
    );

    TestEngine {
        core,
        loopback,
        cancel,
        node_id,
    }
}

impl TestEngine {
    pub async fn client(&self) -> WorldClient<Channel> {
        WorldClient::new(self.loopback.channel().await.expect("loopback channel"))
    }
}

pub fn with_geo(id: &str, lat: f64, lon: f64) -> Entity {
    Entity {
        id: id.into(),
        geo: Some(Geo {
            latitude: lat,
            longitude: lon,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ephemeral(id: &str, lat: f64, lon: f64) -> Entity {
    let mut entity = with_geo(id, lat, lon);
    entity.lifetime = Some(Lifetime {
        from_unix_ms: None,
        until_unix_ms: Some(hydris::entity::now_ms() + 60_000),
    });
    entity
}

pub async fn push_one(client: &mut WorldClient<Channel>, entity: Entity) {
    let response = client
        .push(PushRequest {
            entities: vec![entity],
        })
        .await
        .expect("push rpc")
        .into_inner();
    assert!(response.accepted, "push rejected: {:?}", response.outcomes);
}

/// Polls a getter until it succeeds or the deadline passes.
pub async fn wait_for<F, Fut, T>(mut probe: F, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = probe().await {
            return Some(found);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
