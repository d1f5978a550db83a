use crate::persist::{read_json_or_default, write_json_atomic};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One captured inbound payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: i64,
    pub data: Value,
}

type TraceMap = BTreeMap<String, Vec<TraceEntry>>;

/// Append-only capture of inbound node traffic: `to-node` frames land in
/// `node_responses.json`, `params/remote` responses in `remote_params.json`.
pub struct ResponseTraceStore {
    responses_path: PathBuf,
    params_path: PathBuf,
    responses: Mutex<TraceMap>,
    params: Mutex<TraceMap>,
}

impl ResponseTraceStore {
    pub fn open(config_dir: &Path) -> Self {
        let responses_path = config_dir.join("node_responses.json");
        let params_path = config_dir.join("remote_params.json");
        Self {
            responses: Mutex::new(read_json_or_default(&responses_path)),
            params: Mutex::new(read_json_or_default(&params_path)),
            responses_path,
            params_path,
        }
    }

    pub fn record_node_response(&self, node_id: &str, data: Value) {
        let mut responses = self.responses.lock();
        append(&mut responses, node_id, data);
        if let Err(e) = write_json_atomic(&self.responses_path, &*responses) {
            warn!("Could not store node response: {e}");
        }
    }

    pub fn record_remote_params(&self, node_id: &str, data: Value) {
        let mut params = self.params.lock();
        append(&mut params, node_id, data);
        if let Err(e) = write_json_atomic(&self.params_path, &*params) {
            warn!("Could not store remote params: {e}");
        }
    }

    pub fn node_responses(&self, node_id: &str) -> Vec<TraceEntry> {
        self.responses.lock().get(node_id).cloned().unwrap_or_default()
    }

    pub fn remote_params(&self, node_id: &str) -> Vec<TraceEntry> {
        self.params.lock().get(node_id).cloned().unwrap_or_default()
    }
}

fn append(map: &mut TraceMap, node_id: &str, data: Value) {
    map.entry(node_id.to_string()).or_default().push(TraceEntry {
        timestamp: Utc::now().timestamp_millis(),
        data,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_traces_append_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResponseTraceStore::open(dir.path());

        store.record_node_response("n1", json!({"1": "req-1"}));
        store.record_node_response("n1", json!({"1": "req-2"}));
        store.record_remote_params("n1", json!({"Light": {"output": true}}));

        assert_eq!(store.node_responses("n1").len(), 2);
        assert_eq!(store.node_responses("n1")[1].data["1"], "req-2");
        assert_eq!(store.remote_params("n1").len(), 1);
        assert!(store.node_responses("n2").is_empty());
    }

    #[test]
    fn test_traces_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ResponseTraceStore::open(dir.path());
            store.record_remote_params("n1", json!({"k": 1}));
        }
        let reopened = ResponseTraceStore::open(dir.path());
        assert_eq!(reopened.remote_params("n1").len(), 1);
    }
}
