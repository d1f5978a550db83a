use crate::persist::{read_json_or_default, write_json_atomic};
use crate::{OtaError, OtaStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `node_id → ota_job_id → record` map, the on-disk shape of a partition
pub type OtaPartition = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct OtaState {
    active: OtaPartition,
    history: OtaPartition,
}

/// Durable OTA job registry with two partitions: Active jobs awaiting a
/// terminal status, and History for completed ones. A job lives in exactly
/// one partition at a time.
///
/// Records keep every field of the inbound URL-response payload, plus
/// injected receive/completion timestamps.
pub struct OtaJobStore {
    jobs_path: PathBuf,
    history_path: PathBuf,
    state: Mutex<OtaState>,
}

impl OtaJobStore {
    pub fn open(config_dir: &Path) -> Self {
        let jobs_path = config_dir.join("ota_jobs.json");
        let history_path = config_dir.join("ota_status_history.json");
        let state = OtaState {
            active: read_json_or_default(&jobs_path),
            history: read_json_or_default(&history_path),
        };
        Self {
            jobs_path,
            history_path,
            state: Mutex::new(state),
        }
    }

    /// Ingest an inbound `otaurl` response. The payload must carry a
    /// non-empty `ota_job_id`; an existing Active record for the same job
    /// is overwritten (latest wins).
    pub fn ingest_url_response(&self, node_id: &str, payload: &Value) -> Result<String, OtaError> {
        let job_id = payload
            .get("ota_job_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OtaError::MissingJobId(node_id.to_string()))?
            .to_string();

        let mut record = payload.as_object().cloned().unwrap_or_default();
        let now = Utc::now();
        record.insert("received_at".to_string(), json!(now.to_rfc3339()));
        record.insert("received_ts_ms".to_string(), json!(now.timestamp_millis()));

        let mut state = self.state.lock();
        state
            .active
            .entry(node_id.to_string())
            .or_default()
            .insert(job_id.clone(), Value::Object(record));
        self.persist_active(&state.active);
        info!("Stored OTA job {job_id} for {node_id}");
        Ok(job_id)
    }

    /// Apply an operator-reported status. A terminal status moves the job
    /// from Active to History with completion fields injected; repeating a
    /// terminal status just refreshes the history fields (last write wins).
    /// `in-progress` leaves the job Active. Returns true when History was
    /// touched.
    pub fn record_status(&self, node_id: &str, job_id: &str, status: OtaStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        let mut state = self.state.lock();

        let removed = match state.active.get_mut(node_id) {
            Some(jobs) => jobs.remove(job_id),
            None => None,
        };
        if state
            .active
            .get(node_id)
            .is_some_and(|jobs| jobs.is_empty())
        {
            state.active.remove(node_id);
        }

        let touched = match removed {
            Some(mut record) => {
                if let Some(fields) = record.as_object_mut() {
                    fields.insert("ota_status".to_string(), json!(status.as_str()));
                    fields.insert("status_ts_ms".to_string(), json!(now.timestamp_millis()));
                    fields.insert("status_received_at".to_string(), json!(now.to_rfc3339()));
                }
                state
                    .history
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(job_id.to_string(), record);
                self.persist_active(&state.active);
                info!("OTA job {job_id} for {node_id} completed with status {status}");
                true
            }
            None => match state
                .history
                .get_mut(node_id)
                .and_then(|jobs| jobs.get_mut(job_id))
                .and_then(Value::as_object_mut)
            {
                Some(fields) => {
                    fields.insert("ota_status".to_string(), json!(status.as_str()));
                    fields.insert("status_ts_ms".to_string(), json!(now.timestamp_millis()));
                    fields.insert("status_received_at".to_string(), json!(now.to_rfc3339()));
                    true
                }
                None => false,
            },
        };

        if touched {
            self.persist_history(&state.history);
        }
        touched
    }

    pub fn active_jobs(&self, node_id: Option<&str>) -> OtaPartition {
        let state = self.state.lock();
        filter_partition(&state.active, node_id)
    }

    pub fn history(&self, node_id: Option<&str>) -> OtaPartition {
        let state = self.state.lock();
        filter_partition(&state.history, node_id)
    }

    /// Drop Active jobs, for one node or the whole fleet. Returns how many
    /// jobs were cleared.
    pub fn clear_jobs(&self, node_id: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let cleared = match node_id {
            Some(node_id) => state
                .active
                .remove(node_id)
                .map(|jobs| jobs.len())
                .unwrap_or(0),
            None => {
                let count = state.active.values().map(|jobs| jobs.len()).sum();
                state.active.clear();
                count
            }
        };
        if cleared > 0 {
            self.persist_active(&state.active);
        }
        cleared
    }

    pub fn clear_history(&self, node_id: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let cleared = match node_id {
            Some(node_id) => state
                .history
                .remove(node_id)
                .map(|jobs| jobs.len())
                .unwrap_or(0),
            None => {
                let count = state.history.values().map(|jobs| jobs.len()).sum();
                state.history.clear();
                count
            }
        };
        if cleared > 0 {
            self.persist_history(&state.history);
        }
        cleared
    }

    fn persist_active(&self, active: &OtaPartition) {
        if let Err(e) = write_json_atomic(&self.jobs_path, active) {
            warn!("Could not persist {}: {e}", self.jobs_path.display());
        }
    }

    fn persist_history(&self, history: &OtaPartition) {
        if let Err(e) = write_json_atomic(&self.history_path, history) {
            warn!("Could not persist {}: {e}", self.history_path.display());
        }
    }
}

fn filter_partition(partition: &OtaPartition, node_id: Option<&str>) -> OtaPartition {
    match node_id {
        Some(node_id) => partition
            .get(node_id)
            .map(|jobs| {
                let mut filtered = OtaPartition::new();
                filtered.insert(node_id.to_string(), jobs.clone());
                filtered
            })
            .unwrap_or_default(),
        None => partition.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_response(job_id: &str) -> Value {
        json!({
            "ota_job_id": job_id,
            "url": "https://x",
            "fw_version": "1.2.3"
        })
    }

    #[test]
    fn test_ingest_populates_active_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());

        let job_id = store.ingest_url_response("n1", &url_response("J1")).unwrap();
        assert_eq!(job_id, "J1");

        let active = store.active_jobs(Some("n1"));
        let record = &active["n1"]["J1"];
        assert_eq!(record["url"], "https://x");
        assert_eq!(record["fw_version"], "1.2.3");
        assert!(record["received_ts_ms"].is_i64());
        assert!(record["received_at"].is_string());
    }

    #[test]
    fn test_ingest_without_job_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());

        assert!(store
            .ingest_url_response("n1", &json!({"url": "https://x"}))
            .is_err());
        assert!(store
            .ingest_url_response("n1", &json!({"ota_job_id": ""}))
            .is_err());
        assert!(store.active_jobs(None).is_empty());
    }

    #[test]
    fn test_latest_url_response_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());

        store.ingest_url_response("n1", &url_response("J1")).unwrap();
        store
            .ingest_url_response("n1", &json!({"ota_job_id": "J1", "url": "https://y"}))
            .unwrap();

        let active = store.active_jobs(Some("n1"));
        assert_eq!(active["n1"].len(), 1);
        assert_eq!(active["n1"]["J1"]["url"], "https://y");
    }

    #[test]
    fn test_terminal_status_moves_job_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());
        store.ingest_url_response("n1", &url_response("J1")).unwrap();

        assert!(store.record_status("n1", "J1", OtaStatus::Success));

        let active = store.active_jobs(Some("n1"));
        assert!(active.get("n1").is_none());

        let history = store.history(Some("n1"));
        let record = &history["n1"]["J1"];
        assert_eq!(record["ota_status"], "success");
        assert_eq!(record["fw_version"], "1.2.3");
        assert!(record["status_ts_ms"].is_i64());
    }

    #[test]
    fn test_in_progress_leaves_job_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());
        store.ingest_url_response("n1", &url_response("J1")).unwrap();

        assert!(!store.record_status("n1", "J1", OtaStatus::InProgress));
        assert!(store.active_jobs(Some("n1"))["n1"].contains_key("J1"));
        assert!(store.history(None).is_empty());
    }

    #[test]
    fn test_repeated_terminal_status_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());
        store.ingest_url_response("n1", &url_response("J1")).unwrap();

        store.record_status("n1", "J1", OtaStatus::Failed);
        assert!(store.record_status("n1", "J1", OtaStatus::Failed));

        let history = store.history(Some("n1"));
        assert_eq!(history["n1"].len(), 1);
        assert_eq!(history["n1"]["J1"]["ota_status"], "failed");
    }

    #[test]
    fn test_status_for_unknown_job_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());
        assert!(!store.record_status("n1", "ghost", OtaStatus::Success));
        assert!(store.history(None).is_empty());
    }

    #[test]
    fn test_partitions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OtaJobStore::open(dir.path());
            store.ingest_url_response("n1", &url_response("J1")).unwrap();
            store.ingest_url_response("n1", &url_response("J2")).unwrap();
            store.record_status("n1", "J1", OtaStatus::Rejected);
        }

        let reopened = OtaJobStore::open(dir.path());
        assert!(reopened.active_jobs(Some("n1"))["n1"].contains_key("J2"));
        assert_eq!(
            reopened.history(Some("n1"))["n1"]["J1"]["ota_status"],
            "rejected"
        );
    }

    #[test]
    fn test_malformed_partition_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ota_jobs.json"), "{broken").unwrap();
        let store = OtaJobStore::open(dir.path());
        assert!(store.active_jobs(None).is_empty());
    }

    #[test]
    fn test_clear_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = OtaJobStore::open(dir.path());
        store.ingest_url_response("n1", &url_response("J1")).unwrap();
        store.ingest_url_response("n2", &url_response("J2")).unwrap();

        assert_eq!(store.clear_jobs(Some("n1")), 1);
        assert_eq!(store.clear_jobs(None), 1);
        assert!(store.active_jobs(None).is_empty());
    }
}
