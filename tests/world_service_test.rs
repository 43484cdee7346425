//! End-to-end tests over the in-process loopback transport: the full gRPC
//! stack with the engine behind it.

mod common;

use common::*;
use hydris::entity::now_ms;
use hydris::pb::{
    ChangeKind, Config, Configurable, Controller, Device, Entity, EntityFilter,
    ExpireEntityRequest, GetEntityRequest, GetLocalNodeRequest, Label, ListEntitiesRequest,
    PairingKind, PushRequest, ReconcileRequest, RunTaskRequest, WatchEntitiesRequest,
};
use std::io::Write;
use std::time::Duration;

#[tokio::test]
async fn push_then_get_merges_components_over_the_wire() {
    let engine = boot().await;
    let mut client = engine.client().await;

    push_one(&mut client, with_geo("a", 1.0, 2.0)).await;
    push_one(
        &mut client,
        Entity {
            id: "a".into(),
            label: Some(Label { text: "A".into() }),
            ..Default::default()
        },
    )
    .await;

    let entity = client
        .get_entity(GetEntityRequest {
            entity_id: "a".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .entity
        .unwrap();

    assert_eq!(entity.label.as_ref().unwrap().text, "A");
    assert_eq!(entity.geo.as_ref().unwrap().latitude, 1.0);
    assert_eq!(entity.geo.as_ref().unwrap().longitude, 2.0);
}

#[tokio::test]
async fn get_unknown_entity_is_not_found() {
    let engine = boot().await;
    let mut client = engine.client().await;

    let status = client
        .get_entity(GetEntityRequest {
            entity_id: "missing".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn watch_replays_then_follows_live_changes() {
    let engine = boot().await;
    let mut client = engine.client().await;

    push_one(&mut client, with_geo("track/1", 1.0, 2.0)).await;

    let mut stream = client
        .watch_entities(WatchEntitiesRequest {
            filter: Some(EntityFilter {
                id_regex: Some("^track/".into()),
                ..Default::default()
            }),
            behavior: None,
        })
        .await
        .unwrap()
        .into_inner();

    let replayed = stream.message().await.unwrap().unwrap();
    assert_eq!(replayed.kind(), ChangeKind::Updated);
    assert_eq!(replayed.entity.unwrap().id, "track/1");

    push_one(&mut client, with_geo("track/2", 3.0, 4.0)).await;
    let live = stream.message().await.unwrap().unwrap();
    assert_eq!(live.entity.unwrap().id, "track/2");
}

#[tokio::test]
async fn expire_emits_expired_and_purge_forgets() {
    let engine = boot().await;
    let mut client = engine.client().await;

    push_one(&mut client, with_geo("a", 1.0, 2.0)).await;

    let mut stream = client
        .watch_entities(WatchEntitiesRequest {
            filter: Some(EntityFilter {
                id_equal: Some("a".into()),
                ..Default::default()
            }),
            behavior: None,
        })
        .await
        .unwrap()
        .into_inner();
    // Consume the replay first.
    let replayed = stream.message().await.unwrap().unwrap();
    assert_eq!(replayed.kind(), ChangeKind::Updated);

    client
        .expire_entity(ExpireEntityRequest {
            entity_id: "a".into(),
        })
        .await
        .unwrap();

    let expired = stream.message().await.unwrap().unwrap();
    assert_eq!(expired.kind(), ChangeKind::Expired);

    // Still visible inside the grace window, gone after the purge.
    assert!(client
        .get_entity(GetEntityRequest {
            entity_id: "a".into()
        })
        .await
        .is_ok());
    engine.core.store().purge(now_ms() + 60_000);

    let listed = client
        .list_entities(ListEntitiesRequest {
            filter: Some(EntityFilter {
                id_equal: Some("a".into()),
                ..Default::default()
            }),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(listed.entities.is_empty());
}

#[tokio::test]
async fn local_node_is_served_over_the_wire() {
    let engine = boot().await;
    let mut client = engine.client().await;

    let node = client
        .get_local_node(GetLocalNodeRequest {})
        .await
        .unwrap()
        .into_inner()
        .node
        .unwrap();
    assert_eq!(node.controller.as_ref().unwrap().node, engine.node_id);
}

#[tokio::test]
async fn run_task_without_taskable_is_not_found() {
    let engine = boot().await;
    let mut client = engine.client().await;

    let status = client
        .run_task(RunTaskRequest {
            entity_id: "nothing".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn reconcile_stream_delivers_pair_lifecycle() {
    let engine = boot().await;
    let mut client = engine.client().await;

    push_one(
        &mut client,
        Entity {
            id: "dev1".into(),
            controller: Some(Controller {
                id: "X".into(),
                node: String::new(),
            }),
            device: Some(Device {
                configurable: vec![Configurable {
                    key: "k.v0".into(),
                    schema: None,
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
    )
    .await;

    let mut stream = client
        .reconcile(ReconcileRequest {
            controller: "X".into(),
        })
        .await
        .unwrap()
        .into_inner();

    let config = |value: &str| Entity {
        id: "cfg1".into(),
        config: Some(Config {
            controller: "X".into(),
            key: "k.v0".into(),
            value: value.into(),
            ..Default::default()
        }),
        ..Default::default()
    };

    push_one(&mut client, config("{\"a\":1}")).await;
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.kind(), PairingKind::New);
    assert_eq!(first.config.as_ref().unwrap().id, "cfg1");
    assert_eq!(first.device.as_ref().unwrap().id, "dev1");

    push_one(&mut client, config("{\"a\":2}")).await;
    let second = stream.message().await.unwrap().unwrap();
    assert_eq!(second.kind(), PairingKind::Changed);

    client
        .expire_entity(ExpireEntityRequest {
            entity_id: "dev1".into(),
        })
        .await
        .unwrap();
    let third = stream.message().await.unwrap().unwrap();
    assert_eq!(third.kind(), PairingKind::Removed);
}

#[tokio::test]
async fn in_process_loopback_bypasses_a_deny_all_policy() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "default = \"deny\"").unwrap();
    let engine = boot_with_policy(hydris::policy::PolicyGate::load(file.path()).unwrap()).await;

    // Over the in-process transport, writes pass the gate unconditionally.
    let mut client = engine.client().await;
    push_one(&mut client, with_geo("a", 1.0, 2.0)).await;

    // The same write from a remote caller is refused.
    let response = engine.core.push(
        hydris::policy::Peer::Remote("10.0.0.1".parse().unwrap()),
        vec![with_geo("b", 1.0, 2.0)],
    );
    assert!(!response.accepted);
}

#[tokio::test]
async fn rate_limited_wire_watch_delivers_the_final_state() {
    let engine = boot().await;
    let mut client = engine.client().await;

    let mut stream = client
        .watch_entities(WatchEntitiesRequest {
            filter: Some(EntityFilter {
                id_equal: Some("a".into()),
                ..Default::default()
            }),
            behavior: Some(hydris::pb::StreamBehavior {
                max_rate_hz: Some(5.0),
                ..Default::default()
            }),
        })
        .await
        .unwrap()
        .into_inner();

    let mut burst = Vec::new();
    for i in 0..100 {
        burst.push(with_geo("a", f64::from(i), 2.0));
    }
    client
        .push(PushRequest { entities: burst })
        .await
        .unwrap();

    // The final event delivered within the window carries the 100th state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut last_latitude = None;
    loop {
        tokio::select! {
            message = stream.message() => {
                let event = message.unwrap().unwrap();
                if let Some(entity) = event.entity {
                    last_latitude = entity.geo.map(|geo| geo.latitude);
                    if last_latitude == Some(99.0) {
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    assert_eq!(last_latitude, Some(99.0));
}
