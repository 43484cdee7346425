use crate::pb::Entity;
use crate::store::WorldStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::io::Write;
use std::path::Path;

pub mod manager;


/// Durable subset of the world plus the node identity record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Snapshot format version (for future schema evolution)
    pub snapshot_version: String,

    /// Timestamp when snapshot was created
    pub created_at: DateTime<Utc>,

    /// Stable node identity, persisted across restarts
    pub node_id: String,

    /// Durable entities at snapshot time
    pub entities: Vec<Entity>,
}

/// Whether an entity survives restarts. Configurations and user-added
/// assets are durable; anything owned by a live controller is transient and
/// will be re-published by its controller (the node record is the one
/// controller-owned exception).
pub fn is_durable(entity: &Entity) -> bool {
    if entity.config.is_some() {
        return true;
    }
    match &entity.controller {
        None => true,
        Some(controller) => controller.id.is_empty() || controller.id == "node",
    }
}

impl WorldSnapshot {
    /// Captures the durable subset of the store.
    pub fn from_store(store: &WorldStore, node_id: &str) -> Self {
        let entities: Vec<Entity> = store
            .all_entities()
            .into_iter()
            .filter(is_durable)
            .collect();

        Self {
            snapshot_version: "1".to_string(),
            created_at: Utc::now(),
            node_id: node_id.to_string(),
            entities,
        }
    }

    /// Save snapshot to filesystem as compressed JSON (gzip).
    ///
    /// Uses atomic write: writes to .tmp file, fsyncs, then renames.
    /// This prevents partial/corrupt snapshots from being read.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).context("Failed to serialize snapshot to JSON")?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).context("Failed to create snapshot directory")?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        {
            let tmp_file =
                File::create(&tmp_path).context("Failed to create temporary snapshot file")?;

            let mut encoder = GzEncoder::new(tmp_file, Compression::default());
            encoder
                .write_all(json.as_bytes())
                .context("Failed to write compressed snapshot data")?;

            let file = encoder.finish().context("Failed to finish compression")?;
            file.sync_all()
                .context("Failed to sync snapshot file to disk")?;
        }

        fs::rename(&tmp_path, path).context("Failed to rename temporary snapshot file")?;

        Ok(())
    }

    /// Load snapshot from a compressed (.gz) or plain JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).context("Failed to open snapshot file")?;

        let is_compressed = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "gz")
            .unwrap_or(true);

        let mut json = String::new();
        if is_compressed {
            let mut decoder = GzDecoder::new(file);
            decoder
                .read_to_string(&mut json)
                .context("Failed to decompress snapshot file")?;
        } else {
            let mut file = file;
            file.read_to_string(&mut json)
                .context("Failed to read snapshot file")?;
        }

        serde_json::from_str(&json).context("Failed to deserialize snapshot JSON")
    }

    /// Load the snapshot at `path` if one exists. A missing file is not an
    /// error; a corrupt one is.
    pub fn load_if_exists(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(path).map(Some)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}
