use crate::{monitor::MonitorConfig, pool::PoolConfig, MqttError, MqttResult, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

/// Default broker port for TLS MQTT behind an AWS-IoT-compatible endpoint
pub const DEFAULT_BROKER_PORT: u16 = 443;

/// Top-level configuration for a fleet run
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Broker endpoint, `mqtts://host[:port]` or a bare hostname
    pub broker_url: String,
    /// Certificate discovery roots
    pub cert_paths: Vec<PathBuf>,
    /// Directory holding all persisted operator state
    pub config_dir: PathBuf,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    /// Global subscription slot cap, `None` = unlimited
    pub max_subscriptions: Option<usize>,
}

impl FleetConfig {
    pub fn new(
        broker_url: impl Into<String>,
        cert_paths: Vec<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            cert_paths,
            config_dir: config_dir.into(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            max_subscriptions: None,
        }
    }
}

/// Parse a broker endpoint into `(host, port)`.
///
/// Accepts `mqtts://host[:port]` or a bare `host[:port]`; the port defaults
/// to 443.
pub fn parse_broker_endpoint(broker: &str) -> MqttResult<(String, u16)> {
    let url = if broker.contains("://") {
        Url::parse(broker)
            .map_err(|e| MqttError::Configuration(format!("Invalid broker URL: {e}")))?
    } else {
        Url::parse(&format!("mqtts://{broker}"))
            .map_err(|e| MqttError::Configuration(format!("Invalid broker endpoint: {e}")))?
    };

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::Configuration("No host in broker URL".to_string()))?
        .to_string();
    let port = url.port().unwrap_or(DEFAULT_BROKER_PORT);
    Ok((host, port))
}

/// Certificate paths persisted for a configured node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredNode {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredConfig {
    #[serde(default)]
    broker: String,
    #[serde(default)]
    cert_paths: Vec<String>,
    #[serde(default)]
    nodes: BTreeMap<String, StoredNode>,
}

/// Persisted node identity and broker settings (`config.json` in the
/// configuration directory).
///
/// Node entries whose certificate files have gone missing are pruned on
/// load, and the pruned view is written back.
pub struct ConfigStore {
    path: PathBuf,
    config: parking_lot::Mutex<StoredConfig>,
}

impl ConfigStore {
    pub fn open(config_dir: &Path) -> Self {
        let path = config_dir.join("config.json");
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Malformed {}: {e}; starting from defaults", path.display());
                StoredConfig::default()
            }),
            Err(_) => StoredConfig::default(),
        };

        let before = config.nodes.len();
        config.nodes.retain(|node_id, node| {
            let ok = Path::new(&node.cert_path).exists() && Path::new(&node.key_path).exists();
            if !ok {
                warn!("Pruning node {node_id}: certificate paths no longer exist");
            }
            ok
        });
        let store = Self {
            path,
            config: parking_lot::Mutex::new(config),
        };
        if store.config.lock().nodes.len() != before {
            store.save();
        }
        store
    }

    fn save(&self) {
        let snapshot = self.config.lock().clone();
        if let Err(e) = self.write_out(&snapshot) {
            warn!("Could not save {}: {e}", self.path.display());
        }
    }

    fn write_out(&self, config: &StoredConfig) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    pub fn set_broker(&self, broker: &str) {
        self.config.lock().broker = broker.to_string();
        self.save();
    }

    pub fn broker(&self) -> String {
        self.config.lock().broker.clone()
    }

    pub fn set_cert_paths(&self, paths: &[PathBuf]) {
        self.config.lock().cert_paths =
            paths.iter().map(|p| p.display().to_string()).collect();
        self.save();
    }

    pub fn cert_paths(&self) -> Vec<String> {
        self.config.lock().cert_paths.clone()
    }

    pub fn add_node(&self, node_id: &str, cert_path: &Path, key_path: &Path) {
        self.config.lock().nodes.insert(
            node_id.to_string(),
            StoredNode {
                cert_path: cert_path.display().to_string(),
                key_path: key_path.display().to_string(),
            },
        );
        self.save();
    }

    pub fn node_paths(&self, node_id: &str) -> Option<StoredNode> {
        self.config.lock().nodes.get(node_id).cloned()
    }

    pub fn list_nodes(&self) -> BTreeMap<String, StoredNode> {
        self.config.lock().nodes.clone()
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.config.lock().nodes.remove(node_id).is_some();
        if removed {
            self.save();
        }
        removed
    }
}
