use super::*;
use crate::pb::{Config, Configurable, Controller, Device, Geo, PairingKind};
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn core() -> WorldCore {
    core_with_policy(PolicyGate::permissive())
}

fn core_with_policy(policy: PolicyGate) -> WorldCore {
    let store = Arc::new(WorldStore::new("node-test", 5_000));
    let timeline = TimelineBuffer::new(300_000, 4_096);
    let reconciler = Reconciler::spawn(Arc::clone(&store), CancellationToken::new());
    let node = NodeIdentity::restore_or_create(Some("node-test".into()));
    WorldCore::new(store, timeline, Arc::new(policy), reconciler, node)
}

fn with_geo(id: &str, lat: f64, lon: f64) -> Entity {
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

fn device(id: &str, controller: &str, key: &str) -> Entity {
    Entity {
        id: id.into(),
        controller: Some(Controller {
            id: controller.into(),
            node: String::new(),
        }),
        device: Some(Device {
            configurable: vec![Configurable {
                key: key.into(),
                schema: None,
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config(id: &str, controller: &str, key: &str, value: &str) -> Entity {
    Entity {
        id: id.into(),
        config: Some(Config {
            controller: controller.into(),
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn remote(ip: &str) -> Peer {
    Peer::Remote(ip.parse().unwrap())
}

async fn next_pairing(rx: &mut mpsc::Receiver<Result<Pairing, WorldError>>) -> Pairing {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for pairing")
        .expect("reconcile stream ended")
        .expect("reconcile stream errored")
}

#[tokio::test]
async fn push_then_get_accumulates_components() {
    let core = core();

    let response = core.push(Peer::InProcess, vec![with_geo("a", 1.0, 2.0)]);
    assert!(response.accepted);

    let response = core.push(
        Peer::InProcess,
        vec![Entity {
            id: "a".into(),
            label: Some(crate::pb::Label { text: "A".into() }),
            ..Default::default()
        }],
    );
    assert!(response.accepted);

    let merged = core.get(Peer::InProcess, "a").unwrap();
    assert_eq!(merged.label.as_ref().unwrap().text, "A");
    assert_eq!(merged.geo.as_ref().unwrap().latitude, 1.0);
    assert_eq!(merged.geo.as_ref().unwrap().longitude, 2.0);
}

#[tokio::test]
async fn push_reports_per_entity_outcomes() {
    let core = core();
    let response = core.push(
        Peer::InProcess,
        vec![with_geo("ok", 1.0, 2.0), Entity::default()],
    );

    assert!(!response.accepted);
    assert_eq!(response.outcomes.len(), 2);
    assert!(response.outcomes[0].accepted);
    assert!(!response.outcomes[1].accepted);
    assert!(response.outcomes[1].reason.is_some());
    // The valid entity still landed.
    assert!(core.get(Peer::InProcess, "ok").is_ok());
}

#[tokio::test]
async fn config_entities_need_controller_and_key() {
    let core = core();
    let response = core.push(
        Peer::InProcess,
        vec![Entity {
            id: "cfg".into(),
            config: Some(Config::default()),
            ..Default::default()
        }],
    );
    assert!(!response.accepted);
    assert!(response.outcomes[0]
        .reason
        .as_ref()
        .unwrap()
        .contains("controller"));
}

#[tokio::test]
async fn policy_gates_writes_by_source_address() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [[rule]]
        action = "write"
        source = "192.168.1.1"
        effect = "allow"

        [[rule]]
        action = "read"
        effect = "allow"
        "#
    )
    .unwrap();
    let core = core_with_policy(PolicyGate::load(file.path()).unwrap());

    // Untrusted source: denied, nothing stored.
    let response = core.push(remote("10.0.0.1"), vec![with_geo("a", 1.0, 2.0)]);
    assert!(!response.accepted);
    assert!(matches!(
        core.get(remote("10.0.0.1"), "a"),
        Err(WorldError::NotFound(_))
    ));

    // Trusted source: accepted.
    let response = core.push(remote("192.168.1.1"), vec![with_geo("a", 1.0, 2.0)]);
    assert!(response.accepted);

    // The in-process loopback always succeeds.
    let response = core.push(Peer::InProcess, vec![with_geo("b", 3.0, 4.0)]);
    assert!(response.accepted);
}

#[tokio::test]
async fn expire_is_policy_gated_write() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "default = \"deny\"").unwrap();
    let core = core_with_policy(PolicyGate::load(file.path()).unwrap());

    core.push(Peer::InProcess, vec![with_geo("a", 1.0, 2.0)]);
    assert!(matches!(
        core.expire(remote("10.0.0.1"), "a"),
        Err(WorldError::PolicyDenied { .. })
    ));
    assert!(core.expire(Peer::InProcess, "a").is_ok());
}

#[tokio::test]
async fn run_task_dispatches_by_entity_id() {
    struct Ping;
    #[async_trait]
    impl Taskable for Ping {
        async fn run(&self) -> anyhow::Result<String> {
            Ok("pong".into())
        }
    }

    let core = core();
    core.push(Peer::InProcess, vec![with_geo("sensor/1", 1.0, 2.0)]);
    core.register_taskable("sensor/1", Arc::new(Ping));

    let status = core.run_task(Peer::InProcess, "sensor/1").await.unwrap();
    assert_eq!(status, "pong");

    assert!(matches!(
        core.run_task(Peer::InProcess, "sensor/2").await,
        Err(WorldError::NotFound(_))
    ));
}

#[tokio::test]
async fn local_node_entity_is_served() {
    let core = core();
    let node = core.local_node(Peer::InProcess).unwrap();
    assert_eq!(node.id, "node/node-test");
    assert_eq!(node.controller.as_ref().unwrap().id, "node");
}

#[tokio::test]
async fn reconcile_delivers_new_changed_removed() {
    let core = core();

    core.push(Peer::InProcess, vec![device("dev1", "X", "k.v0")]);
    core.push(Peer::InProcess, vec![config("cfg1", "X", "k.v0", "{\"a\":1}")]);

    let mut rx = core.reconcile(Peer::InProcess, "X").unwrap();
    let first = next_pairing(&mut rx).await;
    assert_eq!(first.kind(), PairingKind::New);
    assert_eq!(first.config.as_ref().unwrap().id, "cfg1");
    assert_eq!(first.device.as_ref().unwrap().id, "dev1");

    core.push(Peer::InProcess, vec![config("cfg1", "X", "k.v0", "{\"a\":2}")]);
    let second = next_pairing(&mut rx).await;
    assert_eq!(second.kind(), PairingKind::Changed);

    core.expire(Peer::InProcess, "dev1").unwrap();
    let third = next_pairing(&mut rx).await;
    assert_eq!(third.kind(), PairingKind::Removed);
}

#[tokio::test]
async fn reconcile_streams_are_scoped_to_their_controller() {
    let core = core();
    core.push(Peer::InProcess, vec![device("dev-x", "X", "k.v0")]);
    core.push(Peer::InProcess, vec![device("dev-y", "Y", "k.v0")]);
    core.push(Peer::InProcess, vec![config("cfg-y", "Y", "k.v0", "{}")]);

    let mut rx = core.reconcile(Peer::InProcess, "X").unwrap();
    core.push(Peer::InProcess, vec![config("cfg-x", "X", "k.v0", "{}")]);

    let event = next_pairing(&mut rx).await;
    assert_eq!(event.config.as_ref().unwrap().id, "cfg-x");
}

#[tokio::test]
async fn watch_is_wired_through_the_broker() {
    let core = core();
    core.push(Peer::InProcess, vec![with_geo("a", 1.0, 2.0)]);

    let mut rx = core.watch(Peer::InProcess, None, None).unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.entity.unwrap().id, "a");
}
