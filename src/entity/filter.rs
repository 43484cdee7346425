use crate::entity::{component_bitmap, has_component};
use crate::error::WorldError;
use crate::pb::{Entity, EntityFilter};
use regex::Regex;

/// A compiled entity filter: the AND of every predicate present in the wire
/// filter. Regexes are compiled once; component checks are bitmap tests.
#[derive(Debug, Default)]
pub struct CompiledFilter {
    id_equal: Option<String>,
    id_regex: Option<Regex>,
    label_regex: Option<Regex>,
    with_components: u32,
    without_components: u32,
    config_key: Option<String>,
    parent_id: Option<String>,
}

impl CompiledFilter {
    /// The empty filter matches every entity.
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn compile(filter: Option<EntityFilter>) -> Result<Self, WorldError> {
        let Some(filter) = filter else {
            return Ok(Self::match_all());
        };

        let compile_regex = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| WorldError::Validation(format!("bad filter regex '{pattern}': {e}")))
        };

        let mut compiled = Self {
            id_equal: filter.id_equal,
            config_key: filter.config_key,
            parent_id: filter.parent_id,
            ..Self::default()
        };
        if let Some(pattern) = &filter.id_regex {
            compiled.id_regex = Some(compile_regex(pattern)?);
        }
        if let Some(pattern) = &filter.label_regex {
            compiled.label_regex = Some(compile_regex(pattern)?);
        }
        for ordinal in filter.with_components {
            if ordinal >= 32 {
                return Err(WorldError::Validation(format!(
                    "unknown component ordinal {ordinal}"
                )));
            }
            compiled.with_components |= 1 << ordinal;
        }
        for ordinal in filter.without_components {
            if ordinal >= 32 {
                return Err(WorldError::Validation(format!(
                    "unknown component ordinal {ordinal}"
                )));
            }
            compiled.without_components |= 1 << ordinal;
        }
        Ok(compiled)
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(id) = &self.id_equal {
            if entity.id != *id {
                return false;
            }
        }
        if let Some(regex) = &self.id_regex {
            if !regex.is_match(&entity.id) {
                return false;
            }
        }
        if let Some(regex) = &self.label_regex {
            match &entity.label {
                Some(label) if regex.is_match(&label.text) => {}
                _ => return false,
            }
        }
        let bitmap = component_bitmap(entity);
        if bitmap & self.with_components != self.with_components {
            return false;
        }
        if bitmap & self.without_components != 0 {
            return false;
        }
        if let Some(key) = &self.config_key {
            match &entity.config {
                Some(config) if config.key == *key => {}
                _ => return false,
            }
        }
        if let Some(parent) = &self.parent_id {
            match entity.device.as_ref().and_then(|d| d.parent.as_ref()) {
                Some(device_parent) if device_parent == parent => {}
                _ => return false,
            }
        }
        true
    }
}

/// Filter requiring one component, for filters built in code.
pub fn with_component(ordinal: u32) -> EntityFilter {
    EntityFilter {
        with_components: vec![ordinal],
        ..Default::default()
    }
}
