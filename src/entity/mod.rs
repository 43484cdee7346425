use crate::error::WorldError;
use crate::pb::{ChangeKind, Controller, Entity, EntityChange, Lifetime};
use chrono::Utc;

pub mod filter;

#[cfg(test)]
mod tests;

/// Component ordinals. These are the wire field numbers of `Entity` and are
/// stable: filters, policy rules, and the presence bitmap all use them.
pub mod component {
    pub const LABEL: u32 = 2;
    pub const CONTROLLER: u32 = 3;
    pub const LIFETIME: u32 = 4;
    pub const GEO: u32 = 5;
    pub const ORIENTATION: u32 = 6;
    pub const KINEMATICS: u32 = 7;
    pub const SYMBOL: u32 = 8;
    pub const TRACK: u32 = 9;
    pub const TRANSPONDER: u32 = 10;
    pub const DETECTION: u32 = 11;
    pub const BEARING: u32 = 12;
    pub const CAMERA: u32 = 13;
    pub const CLASSIFICATION: u32 = 14;
    pub const ADMINISTRATIVE: u32 = 15;
    pub const NAVIGATION: u32 = 16;
    pub const MISSION: u32 = 17;
    pub const SHAPE: u32 = 18;
    pub const DEVICE: u32 = 19;
    pub const CONFIG: u32 = 20;
}

/// Current wall clock in unix milliseconds. All engine timestamps use this.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Presence bitmap over component ordinals, for O(1) filter and policy checks.
pub fn component_bitmap(entity: &Entity) -> u32 {
    let mut bits = 0u32;
    let mut set = |ordinal: u32, present: bool| {
        if present {
            bits |= 1 << ordinal;
        }
    };
    set(component::LABEL, entity.label.is_some());
    set(component::CONTROLLER, entity.controller.is_some());
    set(component::LIFETIME, entity.lifetime.is_some());
    set(component::GEO, entity.geo.is_some());
    set(component::ORIENTATION, entity.orientation.is_some());
    set(component::KINEMATICS, entity.kinematics.is_some());
    set(component::SYMBOL, entity.symbol.is_some());
    set(component::TRACK, entity.track.is_some());
    set(component::TRANSPONDER, entity.transponder.is_some());
    set(component::DETECTION, entity.detection.is_some());
    set(component::BEARING, entity.bearing.is_some());
    set(component::CAMERA, entity.camera.is_some());
    set(component::CLASSIFICATION, entity.classification.is_some());
    set(component::ADMINISTRATIVE, entity.administrative.is_some());
    set(component::NAVIGATION, entity.navigation.is_some());
    set(component::MISSION, entity.mission.is_some());
    set(component::SHAPE, entity.shape.is_some());
    set(component::DEVICE, entity.device.is_some());
    set(component::CONFIG, entity.config.is_some());
    bits
}

pub fn has_component(bitmap: u32, ordinal: u32) -> bool {
    ordinal < 32 && bitmap & (1 << ordinal) != 0
}

/// Validates a pushed partial entity. Only the id is mandatory; everything
/// else is an optional component.
pub fn validate(entity: &Entity) -> Result<(), WorldError> {
    if entity.id.is_empty() {
        return Err(WorldError::Validation("entity id must not be empty".into()));
    }
    Ok(())
}

/// Merges a partial entity into a stored one. Components present in the
/// patch replace the stored component wholesale; absent components are left
/// untouched. An explicitly present empty component therefore replaces,
/// while a missing field preserves.
pub fn merge(stored: &mut Entity, patch: Entity) {
    macro_rules! take {
        ($field:ident) => {
            if patch.$field.is_some() {
                stored.$field = patch.$field;
            }
        };
    }
    take!(label);
    take!(controller);
    take!(lifetime);
    take!(geo);
    take!(orientation);
    take!(kinematics);
    take!(symbol);
    take!(track);
    take!(transponder);
    take!(detection);
    take!(bearing);
    take!(camera);
    take!(classification);
    take!(administrative);
    take!(navigation);
    take!(mission);
    take!(shape);
    take!(device);
    take!(config);
}

/// Stamps the owning node on an entity when unset. Entities arriving from a
/// federation peer keep their origin node.
pub fn default_controller_node(entity: &mut Entity, node_id: &str) {
    let controller = entity.controller.get_or_insert_with(Controller::default);
    if controller.node.is_empty() {
        controller.node = node_id.to_string();
    }
}

pub fn until_ms(entity: &Entity) -> Option<i64> {
    entity.lifetime.as_ref().and_then(|l| l.until_unix_ms)
}

/// An entity is expired iff `lifetime.until` is present and not after `now`.
pub fn is_expired(entity: &Entity, now: i64) -> bool {
    matches!(until_ms(entity), Some(until) if until <= now)
}

/// Rewrites `lifetime.until`, preserving `lifetime.from`.
pub fn set_until(entity: &mut Entity, until: i64) {
    let lifetime = entity.lifetime.get_or_insert_with(Lifetime::default);
    lifetime.until_unix_ms = Some(until);
}

/// Delivery priority of a change event. Terminal events outrank updates so
/// the broker never coalesces them away; keepalives sit below any floor.
pub fn change_priority(kind: ChangeKind) -> u32 {
    match kind {
        ChangeKind::Expired | ChangeKind::Unobserved => 2,
        ChangeKind::Updated => 1,
        ChangeKind::Keepalive | ChangeKind::Unspecified => 0,
    }
}

pub fn change(kind: ChangeKind, entity: Entity, at_ms: i64) -> EntityChange {
    EntityChange {
        kind: kind as i32,
        entity: Some(entity),
        observed_unix_ms: at_ms,
    }
}

pub fn keepalive(at_ms: i64) -> EntityChange {
    EntityChange {
        kind: ChangeKind::Keepalive as i32,
        entity: None,
        observed_unix_ms: at_ms,
    }
}
