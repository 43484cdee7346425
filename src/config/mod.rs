use serde::Deserialize;

/// Complete engine configuration, loaded from a TOML file with per-section
/// defaults. The file path comes from `HYDRIS_CONFIG` (default
/// `config.toml`); a missing file falls back to defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct HydrisConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub permissions: Permissions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// gRPC and JSON bridge share this listener.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// Rule module path. Absent means an unrestricted gate.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    /// Snapshot file path. Absent disables persistence.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval() -> u64 {
    60
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_secs: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
    /// How long expired entities linger before eviction.
    #[serde(default = "default_expiry_grace")]
    pub expiry_grace_ms: i64,
}

fn default_purge_interval() -> u64 {
    1_000
}

fn default_expiry_grace() -> i64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            purge_interval_ms: default_purge_interval(),
            expiry_grace_ms: default_expiry_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    #[serde(default = "default_timeline_window")]
    pub window_secs: i64,
    #[serde(default = "default_timeline_events")]
    pub max_events: usize,
}

fn default_timeline_window() -> i64 {
    300
}

fn default_timeline_events() -> usize {
    65_536
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            window_secs: default_timeline_window(),
            max_events: default_timeline_events(),
        }
    }
}

/// Host-granted permissions gating optional subsystems.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Permissions {
    /// Allow controllers to enumerate local serial/USB devices.
    #[serde(default)]
    pub allow_local_serial: bool,
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<HydrisConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: HydrisConfig = toml::from_str(&contents)?;
    Ok(config)
}

impl Default for HydrisConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            policy: PolicyConfig::default(),
            persist: PersistConfig::default(),
            store: StoreConfig::default(),
            timeline: TimelineConfig::default(),
            permissions: Permissions::default(),
        }
    }
}
