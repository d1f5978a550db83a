//! Shared fixtures: on-disk certificate trees and fleet configurations
//! pointed at temp directories.

use rmfleet_core::FleetConfig;
use std::path::{Path, PathBuf};

/// Write a MAC-address-layout certificate tree for the given node ids.
/// Returns the discovery root.
pub fn node_tree(root: &Path, node_ids: &[&str]) -> PathBuf {
    let certs = root.join("certs");
    for (index, node_id) in node_ids.iter().enumerate() {
        let mac_dir = certs.join(format!("AABBCCDD{index:04X}"));
        std::fs::create_dir_all(&mac_dir).unwrap();
        std::fs::write(mac_dir.join("node.info"), format!("{node_id}\n")).unwrap();
        std::fs::write(mac_dir.join("node.crt"), "test certificate").unwrap();
        std::fs::write(mac_dir.join("node.key"), "test key").unwrap();
        std::fs::write(mac_dir.join("root.pem"), "test ca").unwrap();
    }
    certs
}

/// A fleet config with fast timeouts and no backoff, suitable for mocks
pub fn test_config(cert_root: PathBuf, state_dir: PathBuf) -> FleetConfig {
    let mut config = FleetConfig::new("mqtts://broker.example.com", vec![cert_root], state_dir);
    config.pool.connection_timeout = std::time::Duration::from_millis(500);
    config.pool.retry_backoff_base = 0.0;
    config.pool.jitter_range = 0.0;
    config
}
