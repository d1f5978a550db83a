use crate::persist::{read_json_or_default, write_json_atomic};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A node's entry in the active-session file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveNode {
    pub connected_at: i64,
    pub status: String,
    pub cert_path: String,
    pub key_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveSession {
    session_start: i64,
    broker: String,
    cert_base_path: String,
    nodes: BTreeMap<String, ActiveNode>,
}

/// One connect/disconnect event in the durable history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    pub timestamp: i64,
    pub session_id: i64,
    pub cert_path: String,
    pub key_path: String,
    pub broker: String,
    pub cert_base_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConnectionHistory {
    #[serde(default)]
    nodes: BTreeMap<String, Vec<HistoryEntry>>,
}

/// Durable record of the current session (`active_config.json`, truncated
/// at process start and exit) and the append-only per-node connection
/// history (`config_history.json`, preserved across runs).
///
/// The session id is the active session's start timestamp in epoch millis.
pub struct SessionStateStore {
    active_path: PathBuf,
    history_path: PathBuf,
    broker: String,
    cert_base_path: String,
    active: Mutex<ActiveSession>,
    history: Mutex<ConnectionHistory>,
}

impl SessionStateStore {
    /// Start a session: truncate the active file to an empty-nodes
    /// scaffold and load the retained history.
    pub fn begin(config_dir: &Path, broker: &str, cert_base_path: &str) -> Self {
        let active_path = config_dir.join("active_config.json");
        let history_path = config_dir.join("config_history.json");

        let active = ActiveSession {
            session_start: Utc::now().timestamp_millis(),
            broker: broker.to_string(),
            cert_base_path: cert_base_path.to_string(),
            nodes: BTreeMap::new(),
        };
        if let Err(e) = write_json_atomic(&active_path, &active) {
            warn!("Could not clear active session file: {e}");
        }

        let history: ConnectionHistory = read_json_or_default(&history_path);

        Self {
            active_path,
            history_path,
            broker: broker.to_string(),
            cert_base_path: cert_base_path.to_string(),
            active: Mutex::new(active),
            history: Mutex::new(history),
        }
    }

    pub fn session_id(&self) -> i64 {
        self.active.lock().session_start
    }

    pub fn record_connect(&self, node_id: &str, cert_path: &str, key_path: &str) {
        let now = Utc::now().timestamp_millis();
        {
            let mut active = self.active.lock();
            active.nodes.insert(
                node_id.to_string(),
                ActiveNode {
                    connected_at: now,
                    status: "connected".to_string(),
                    cert_path: cert_path.to_string(),
                    key_path: key_path.to_string(),
                    disconnected_at: None,
                },
            );
            self.persist_active(&active);
        }
        self.append_history(node_id, "connected", now, cert_path, key_path);
    }

    pub fn record_disconnect(&self, node_id: &str) {
        let now = Utc::now().timestamp_millis();
        let (cert_path, key_path) = {
            let mut active = self.active.lock();
            let paths = match active.nodes.get_mut(node_id) {
                Some(node) => {
                    node.disconnected_at = Some(now);
                    node.status = "disconnected".to_string();
                    (node.cert_path.clone(), node.key_path.clone())
                }
                None => (String::new(), String::new()),
            };
            self.persist_active(&active);
            paths
        };
        self.append_history(node_id, "disconnected", now, &cert_path, &key_path);
    }

    fn append_history(
        &self,
        node_id: &str,
        action: &str,
        timestamp: i64,
        cert_path: &str,
        key_path: &str,
    ) {
        let mut history = self.history.lock();
        history
            .nodes
            .entry(node_id.to_string())
            .or_default()
            .push(HistoryEntry {
                action: action.to_string(),
                timestamp,
                session_id: self.session_id(),
                cert_path: cert_path.to_string(),
                key_path: key_path.to_string(),
                broker: self.broker.clone(),
                cert_base_path: self.cert_base_path.clone(),
            });
        if let Err(e) = write_json_atomic(&self.history_path, &*history) {
            warn!("Could not save connection history: {e}");
        }
    }

    pub fn node_history(&self, node_id: &str) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .nodes
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_nodes(&self) -> BTreeMap<String, ActiveNode> {
        self.active.lock().nodes.clone()
    }

    /// End the session: the active file goes back to an empty-nodes
    /// scaffold, stamped with a fresh start time.
    pub fn end(&self) {
        let scaffold = ActiveSession {
            session_start: Utc::now().timestamp_millis(),
            broker: self.broker.clone(),
            cert_base_path: self.cert_base_path.clone(),
            nodes: BTreeMap::new(),
        };
        if let Err(e) = write_json_atomic(&self.active_path, &scaffold) {
            warn!("Could not clear active session file: {e}");
        }
    }

    fn persist_active(&self, active: &ActiveSession) {
        if let Err(e) = write_json_atomic(&self.active_path, active) {
            warn!("Could not update active session: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_begin_truncates_active_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("active_config.json"),
            r#"{"session_start": 1, "broker": "old", "cert_base_path": "", "nodes": {"stale": {}}}"#,
        )
        .unwrap();

        let store = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");
        assert!(store.active_nodes().is_empty());

        let raw = std::fs::read_to_string(dir.path().join("active_config.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["broker"], "mqtts://broker");
        assert!(value["nodes"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_connect_and_disconnect_stamping() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");

        store.record_connect("n1", "/c/n1.crt", "/c/n1.key");
        let nodes = store.active_nodes();
        assert_eq!(nodes["n1"].status, "connected");
        assert!(nodes["n1"].disconnected_at.is_none());

        store.record_disconnect("n1");
        let nodes = store.active_nodes();
        assert_eq!(nodes["n1"].status, "disconnected");
        assert!(nodes["n1"].disconnected_at.is_some());

        let history = store.node_history("n1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "connected");
        assert_eq!(history[1].action, "disconnected");
        assert_eq!(history[0].session_id, store.session_id());
    }

    #[test]
    fn test_history_is_preserved_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");
            store.record_connect("n1", "/c/n1.crt", "/c/n1.key");
            store.end();
        }

        let second = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");
        assert_eq!(second.node_history("n1").len(), 1);
        assert!(second.active_nodes().is_empty());
    }

    #[test]
    fn test_end_writes_empty_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");
        store.record_connect("n1", "/c/n1.crt", "/c/n1.key");
        store.end();

        let raw = std::fs::read_to_string(dir.path().join("active_config.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert!(value["nodes"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_history_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config_history.json"), "not json").unwrap();
        let store = SessionStateStore::begin(dir.path(), "mqtts://broker", "/certs");
        assert!(store.node_history("n1").is_empty());
    }
}
