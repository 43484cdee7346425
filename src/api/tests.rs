use super::*;
use crate::node::NodeIdentity;
use crate::pb::{Entity, Geo};
use crate::policy::PolicyGate;
use crate::reconcile::Reconciler;
use crate::store::WorldStore;
use crate::timeline::TimelineBuffer;
use tokio_util::sync::CancellationToken;

fn state() -> ApiState {
    let store = Arc::new(WorldStore::new("node-test", 5_000));
    let timeline = TimelineBuffer::new(300_000, 4_096);
    let reconciler = Reconciler::spawn(Arc::clone(&store), CancellationToken::new());
    let node = NodeIdentity::restore_or_create(Some("node-test".into()));
    let core = WorldCore::new(
        store,
        timeline,
        Arc::new(PolicyGate::permissive()),
        reconciler,
        node,
    );
    ApiState {
        core: Arc::new(core),
    }
}

fn caller() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 41000)))
}

fn with_geo(id: &str) -> Entity {
    Entity {
        id: id.into(),
        geo: Some(Geo {
            latitude: 1.0,
            longitude: 2.0,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn healthz_is_plain_ok() {
    assert_eq!(healthz().await, "OK");
}

#[tokio::test]
async fn push_then_get_over_the_bridge() {
    let state = state();

    let response = push(
        State(state.clone()),
        caller(),
        Json(PushRequest {
            entities: vec![with_geo("a")],
        }),
    )
    .await;
    assert!(response.0.accepted);

    let response = get_entity(State(state), caller(), Path("a".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn get_unknown_entity_is_404() {
    let state = state();
    let err = get_entity(State(state), caller(), Path("missing".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expire_returns_no_content() {
    let state = state();
    push(
        State(state.clone()),
        caller(),
        Json(PushRequest {
            entities: vec![with_geo("a")],
        }),
    )
    .await;

    let status = expire_entity(State(state), caller(), Path("a".to_string()))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn local_node_is_served() {
    let state = state();
    let response = local_node(State(state), caller()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn filter_params_parse_component_lists() {
    let params = FilterParams {
        with: Some("19,20".into()),
        without: Some("4".into()),
        ..Default::default()
    };
    let filter = params.into_filter().unwrap().unwrap();
    assert_eq!(filter.with_components, vec![19, 20]);
    assert_eq!(filter.without_components, vec![4]);
}

#[test]
fn filter_params_reject_garbage_ordinals() {
    let params = FilterParams {
        with: Some("device".into()),
        ..Default::default()
    };
    assert!(params.into_filter().is_err());
}
