use crate::pb::{Controller, Entity, Label};
use uuid::Uuid;

/// Controller name reserved for the node identity entity.
pub const NODE_CONTROLLER: &str = "node";

/// Stable identity of this engine process. The id is minted once and then
/// persisted through the snapshot, so it survives restarts.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
}

impl NodeIdentity {
    /// Reuses a persisted id when one exists, otherwise mints a fresh one.
    pub fn restore_or_create(persisted: Option<String>) -> Self {
        let node_id = match persisted {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        Self { node_id }
    }

    /// Entity id of the local-node singleton.
    pub fn entity_id(&self) -> String {
        format!("node/{}", self.node_id)
    }

    /// The singleton entity representing this node, republished at startup
    /// and served by `GetLocalNode`.
    pub fn entity(&self) -> Entity {
        let short = self.node_id.get(..8).unwrap_or(&self.node_id);
        Entity {
            id: self.entity_id(),
            label: Some(Label {
                text: format!("hydris node {short}"),
            }),
            controller: Some(Controller {
                id: NODE_CONTROLLER.to_string(),
                node: self.node_id.clone(),
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_id_is_reused() {
        let identity = NodeIdentity::restore_or_create(Some("abc-123".into()));
        assert_eq!(identity.node_id, "abc-123");
        assert_eq!(identity.entity_id(), "node/abc-123");
    }

    #[test]
    fn fresh_id_is_minted_when_absent_or_empty() {
        let a = NodeIdentity::restore_or_create(None);
        let b = NodeIdentity::restore_or_create(Some(String::new()));
        assert!(!a.node_id.is_empty());
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn node_entity_carries_the_reserved_controller() {
        let identity = NodeIdentity::restore_or_create(Some("abc-123".into()));
        let entity = identity.entity();
        let controller = entity.controller.unwrap();
        assert_eq!(controller.id, NODE_CONTROLLER);
        assert_eq!(controller.node, "abc-123");
    }
}
