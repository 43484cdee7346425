use crate::pb::world_client::WorldClient;
use crate::pb::{
    Configurable, Controller, Device, DeviceState, Entity, Label, PushRequest,
};
use anyhow::{bail, Context, Result};
use tonic::transport::Channel;
use tracing::info;

pub fn root_device_id(controller: &str) -> String {
    format!("device/{controller}")
}

/// The root device entity a controller publishes at startup: it owns the
/// controller name and advertises the configuration keys the controller
/// accepts. Durable (no lifetime) — it is republished on every start.
pub fn root_device(controller: &str, configurable: Vec<Configurable>) -> Entity {
    Entity {
        id: root_device_id(controller),
        label: Some(Label {
            text: controller.to_string(),
        }),
        controller: Some(Controller {
            id: controller.to_string(),
            node: String::new(),
        }),
        device: Some(Device {
            configurable,
            state: DeviceState::Present as i32,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A hotplugged child of a controller's root device. The caller fills in
/// the transport address (`usb`/`serial`/`ip`) and labels; the parent link
/// and controller ownership are stamped here.
pub fn child_device(controller: &str, id: &str, mut descriptor: Device) -> Entity {
    descriptor.parent = Some(root_device_id(controller));
    if descriptor.state == DeviceState::Unspecified as i32 {
        descriptor.state = DeviceState::Present as i32;
    }
    Entity {
        id: id.to_string(),
        controller: Some(Controller {
            id: controller.to_string(),
            node: String::new(),
        }),
        device: Some(descriptor),
        ..Default::default()
    }
}

/// Pushes a device entity and fails on rejection.
pub async fn publish(client: &mut WorldClient<Channel>, entity: Entity) -> Result<()> {
    let id = entity.id.clone();
    let response = client
        .push(PushRequest {
            entities: vec![entity],
        })
        .await
        .context("pushing device entity")?
        .into_inner();
    if !response.accepted {
        let reason = response
            .outcomes
            .first()
            .and_then(|outcome| outcome.reason.clone())
            .unwrap_or_else(|| "unknown".to_string());
        bail!("device entity '{id}' rejected: {reason}");
    }
    info!(entity_id = %id, "Device published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_device_owns_its_controller_name() {
        let entity = root_device(
            "radio",
            vec![Configurable {
                key: "radio.v0".into(),
                schema: None,
            }],
        );
        assert_eq!(entity.id, "device/radio");
        assert_eq!(entity.controller.as_ref().unwrap().id, "radio");
        let device = entity.device.as_ref().unwrap();
        assert_eq!(device.configurable[0].key, "radio.v0");
        assert_eq!(device.state, DeviceState::Present as i32);
        assert!(entity.lifetime.is_none(), "root devices are durable");
    }

    #[test]
    fn child_device_links_to_its_parent() {
        let entity = child_device("radio", "device/radio/ttyUSB0", Device::default());
        let device = entity.device.as_ref().unwrap();
        assert_eq!(device.parent.as_deref(), Some("device/radio"));
        assert_eq!(device.state, DeviceState::Present as i32);
        assert_eq!(entity.controller.as_ref().unwrap().id, "radio");
    }
}
