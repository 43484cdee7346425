use crate::pb::{Config, DeviceSelector, Entity};

/// A discovered device plus the moment it first appeared. Discovery time is
/// the "length of the live relationship" used to rank candidates.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub entity: Entity,
    pub discovered_ms: i64,
}

/// Whether `device` can serve `config`: the device is published by the
/// configuration's controller, advertises the configuration's key, and
/// passes the optional selector.
pub fn is_candidate(config: &Config, device: &Entity) -> bool {
    let Some(controller) = &device.controller else {
        return false;
    };
    if controller.id != config.controller {
        return false;
    }
    let Some(descriptor) = &device.device else {
        return false;
    };
    if !descriptor
        .configurable
        .iter()
        .any(|entry| entry.key == config.key)
    {
        return false;
    }
    match &config.selector {
        Some(selector) => selector_matches(selector, device),
        None => true,
    }
}

/// Selector predicates AND together: exact id, exact label text, and a
/// required subset of the device's labels.
pub fn selector_matches(selector: &DeviceSelector, device: &Entity) -> bool {
    if let Some(id) = &selector.id {
        if device.id != *id {
            return false;
        }
    }
    if let Some(label) = &selector.label {
        match &device.label {
            Some(device_label) if device_label.text == *label => {}
            _ => return false,
        }
    }
    if !selector.labels.is_empty() {
        let Some(descriptor) = &device.device else {
            return false;
        };
        for (key, value) in &selector.labels {
            if descriptor.labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    true
}

/// Ranks candidates: earliest discovery wins, ties broken lexicographically
/// by device id.
pub fn pick_device<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a DeviceRecord)>,
{
    candidates
        .into_iter()
        .min_by_key(|(id, record)| (record.discovered_ms, *id))
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pb::{Configurable, Controller, Device, Label};
    use std::collections::HashMap;

    fn config(controller: &str, key: &str) -> Config {
        Config {
            controller: controller.into(),
            key: key.into(),
            value: "{}".into(),
            ..Default::default()
        }
    }

    fn device(id: &str, controller: &str, keys: &[&str]) -> Entity {
        Entity {
            id: id.into(),
            controller: Some(Controller {
                id: controller.into(),
                node: "node-test".into(),
            }),
            device: Some(Device {
                configurable: keys
                    .iter()
                    .map(|key| Configurable {
                        key: (*key).into(),
                        schema: None,
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn record(entity: Entity, discovered_ms: i64) -> DeviceRecord {
        DeviceRecord {
            entity,
            discovered_ms,
        }
    }

    #[test]
    fn candidacy_requires_controller_and_advertised_key() {
        let cfg = config("radio", "radio.v0");
        assert!(is_candidate(&cfg, &device("dev1", "radio", &["radio.v0"])));
        assert!(!is_candidate(&cfg, &device("dev2", "camera", &["radio.v0"])));
        assert!(!is_candidate(&cfg, &device("dev3", "radio", &["radio.v1"])));
        assert!(!is_candidate(
            &cfg,
            &Entity {
                id: "bare".into(),
                ..Default::default()
            }
        ));
    }

    #[test]
    fn selector_narrows_by_id() {
        let mut cfg = config("radio", "radio.v0");
        cfg.selector = Some(DeviceSelector {
            id: Some("dev2".into()),
            ..Default::default()
        });
        assert!(!is_candidate(&cfg, &device("dev1", "radio", &["radio.v0"])));
        assert!(is_candidate(&cfg, &device("dev2", "radio", &["radio.v0"])));
    }

    #[test]
    fn selector_narrows_by_label_text() {
        let mut cfg = config("radio", "radio.v0");
        cfg.selector = Some(DeviceSelector {
            label: Some("north mast".into()),
            ..Default::default()
        });

        let mut labeled = device("dev1", "radio", &["radio.v0"]);
        labeled.label = Some(Label {
            text: "north mast".into(),
        });
        assert!(is_candidate(&cfg, &labeled));
        assert!(!is_candidate(&cfg, &device("dev2", "radio", &["radio.v0"])));
    }

    #[test]
    fn selector_requires_label_subset() {
        let mut cfg = config("radio", "radio.v0");
        cfg.selector = Some(DeviceSelector {
            labels: HashMap::from([("site".to_string(), "north".to_string())]),
            ..Default::default()
        });

        let mut tagged = device("dev1", "radio", &["radio.v0"]);
        tagged.device.as_mut().unwrap().labels =
            HashMap::from([("site".to_string(), "north".to_string()),
                           ("rack".to_string(), "2".to_string())]);
        assert!(is_candidate(&cfg, &tagged));

        let mut wrong = device("dev2", "radio", &["radio.v0"]);
        wrong.device.as_mut().unwrap().labels =
            HashMap::from([("site".to_string(), "south".to_string())]);
        assert!(!is_candidate(&cfg, &wrong));
    }

    #[test]
    fn longest_live_relationship_wins() {
        let older = record(device("dev-b", "radio", &["radio.v0"]), 100);
        let newer = record(device("dev-a", "radio", &["radio.v0"]), 200);
        let picked = pick_device(vec![("dev-b", &older), ("dev-a", &newer)]);
        assert_eq!(picked, Some("dev-b"));
    }

    #[test]
    fn ties_break_lexicographically_by_device_id() {
        let a = record(device("dev-a", "radio", &["radio.v0"]), 100);
        let b = record(device("dev-b", "radio", &["radio.v0"]), 100);
        let picked = pick_device(vec![("dev-b", &b), ("dev-a", &a)]);
        assert_eq!(picked, Some("dev-a"));
    }

    #[test]
    fn no_candidates_means_no_pick() {
        assert_eq!(pick_device(Vec::new()), None);
    }
}
