use super::*;
use crate::pb::{Geo, Label};

fn geo(lat: f64, lon: f64) -> Geo {
    Geo {
        latitude: lat,
        longitude: lon,
        ..Default::default()
    }
}

#[test]
fn merge_replaces_present_components_and_keeps_absent_ones() {
    let mut stored = Entity {
        id: "a".into(),
        geo: Some(geo(1.0, 2.0)),
        ..Default::default()
    };

    // Patch carries only a label; geo must survive.
    merge(
        &mut stored,
        Entity {
            id: "a".into(),
            label: Some(Label { text: "A".into() }),
            ..Default::default()
        },
    );
    assert_eq!(stored.label.as_ref().unwrap().text, "A");
    assert_eq!(stored.geo.as_ref().unwrap().latitude, 1.0);

    // Patch carries a new geo; it replaces the component wholesale.
    merge(
        &mut stored,
        Entity {
            id: "a".into(),
            geo: Some(geo(3.0, 4.0)),
            ..Default::default()
        },
    );
    assert_eq!(stored.geo.as_ref().unwrap().latitude, 3.0);
    assert_eq!(stored.label.as_ref().unwrap().text, "A");
}

#[test]
fn merge_explicit_empty_component_replaces() {
    let mut stored = Entity {
        id: "a".into(),
        label: Some(Label { text: "A".into() }),
        ..Default::default()
    };
    merge(
        &mut stored,
        Entity {
            id: "a".into(),
            label: Some(Label::default()),
            ..Default::default()
        },
    );
    assert_eq!(stored.label.as_ref().unwrap().text, "");
}

#[test]
fn bitmap_tracks_presence() {
    let mut entity = Entity {
        id: "a".into(),
        ..Default::default()
    };
    assert_eq!(component_bitmap(&entity), 0);

    entity.geo = Some(geo(0.0, 0.0));
    entity.label = Some(Label::default());
    let bits = component_bitmap(&entity);
    assert!(has_component(bits, component::GEO));
    assert!(has_component(bits, component::LABEL));
    assert!(!has_component(bits, component::DEVICE));
}

#[test]
fn expiry_is_until_not_after_now() {
    let mut entity = Entity {
        id: "a".into(),
        ..Default::default()
    };
    assert!(!is_expired(&entity, 1_000));

    set_until(&mut entity, 999);
    assert!(is_expired(&entity, 1_000));

    set_until(&mut entity, 1_000);
    assert!(is_expired(&entity, 1_000));

    set_until(&mut entity, 1_001);
    assert!(!is_expired(&entity, 1_000));
}

#[test]
fn controller_node_defaults_only_when_unset() {
    let mut entity = Entity {
        id: "a".into(),
        ..Default::default()
    };
    default_controller_node(&mut entity, "node-a");
    assert_eq!(entity.controller.as_ref().unwrap().node, "node-a");

    // An origin node set by a peer is preserved.
    entity.controller.as_mut().unwrap().node = "node-b".into();
    default_controller_node(&mut entity, "node-a");
    assert_eq!(entity.controller.as_ref().unwrap().node, "node-b");
}

#[test]
fn validate_rejects_empty_id() {
    assert!(validate(&Entity::default()).is_err());
    assert!(validate(&Entity {
        id: "a".into(),
        ..Default::default()
    })
    .is_ok());
}
