use crate::{
    monitor::{AdaptiveMonitor, DEFAULT_MONITOR_TOPICS},
    ota_store::OtaJobStore,
    pool::ConnectionPool,
    response_store::ResponseTraceStore,
    session::MessageHandler,
    subscription::SelectiveSubscriptionManager,
    CommandFrame, MqttError, MqttResult, OtaStatus,
};
use rumqttc::QoS;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One-way hook for inbound node traffic: `(node_id, topic_suffix, payload)`.
/// Supplied by the surrounding shell; the core holds no reference back.
pub type MessageSink = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

/// Publish attempt budget per node, reconnects interleaved
const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-node outcome of a fleet publish
#[derive(Debug, Default)]
pub struct PublishReport {
    pub results: BTreeMap<String, MqttResult<()>>,
}

impl PublishReport {
    pub fn successes(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// The operator's verbs: composes `node/<id>/<suffix>` topics, publishes
/// with reconnect-and-retry, and wires inbound subscriptions into the OTA
/// store, the response traces and the monitor.
pub struct FleetOperator {
    pool: Arc<ConnectionPool>,
    monitor: Arc<AdaptiveMonitor>,
    subscriptions: Arc<SelectiveSubscriptionManager>,
    ota: Arc<OtaJobStore>,
    traces: Arc<ResponseTraceStore>,
    sink: Option<MessageSink>,
}

impl FleetOperator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        monitor: Arc<AdaptiveMonitor>,
        subscriptions: Arc<SelectiveSubscriptionManager>,
        ota: Arc<OtaJobStore>,
        traces: Arc<ResponseTraceStore>,
        sink: Option<MessageSink>,
    ) -> Self {
        Self {
            pool,
            monitor,
            subscriptions,
            ota,
            traces,
            sink,
        }
    }

    /// Operator-supplied allow-list, or every currently Connected node
    fn resolve_targets(&self, targets: Option<&[String]>) -> Vec<String> {
        match targets {
            Some(list) => list.to_vec(),
            None => self.pool.connected_nodes(),
        }
    }

    /// Publish to one node with up to three attempts. A stale session is
    /// reconnected before each attempt; exhausting the budget marks the
    /// node failed and signals the monitor.
    async fn publish_with_retry(
        &self,
        node_id: &str,
        suffix: &str,
        payload: &[u8],
        qos: QoS,
    ) -> MqttResult<()> {
        let Some(session) = self.pool.get_session(node_id) else {
            return Err(MqttError::PublishFailed(format!(
                "{node_id} is not available"
            )));
        };
        let topic = format!("node/{node_id}/{suffix}");
        let mut last_error = MqttError::PublishFailed("no attempt made".to_string());

        for attempt in 0..PUBLISH_ATTEMPTS {
            if attempt > 0 {
                sleep(PUBLISH_RETRY_DELAY).await;
            }
            if !session.is_connected().await {
                if let Err(e) = session.reconnect().await {
                    debug!("Reconnect for {node_id} failed (attempt {}): {e}", attempt + 1);
                    last_error = e;
                    continue;
                }
            }
            match session.publish(&topic, payload, qos).await {
                Ok(()) => {
                    self.monitor.record_node_activity(node_id, true);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Publish to {topic} failed (attempt {}): {e}", attempt + 1);
                    last_error = e;
                }
            }
        }

        self.pool.record_publish_failure(node_id);
        self.monitor.record_node_error(node_id);
        Err(match last_error {
            e @ MqttError::PublishFailed(_) => e,
            other => MqttError::PublishFailed(other.to_string()),
        })
    }

    /// Publish one JSON payload to every target node
    async fn publish_json(
        &self,
        targets: Option<&[String]>,
        suffix: &str,
        payload: &Value,
        qos: QoS,
    ) -> PublishReport {
        let bytes = payload.to_string().into_bytes();
        let mut report = PublishReport::default();
        for node_id in self.resolve_targets(targets) {
            let result = self.publish_with_retry(&node_id, suffix, &bytes, qos).await;
            report.results.insert(node_id, result);
        }
        report
    }

    pub async fn send_config(&self, targets: Option<&[String]>, config: &Value) -> PublishReport {
        self.publish_json(targets, "config", config, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_params(&self, targets: Option<&[String]>, params: &Value) -> PublishReport {
        self.publish_json(targets, "params/local", params, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_init_params(
        &self,
        targets: Option<&[String]>,
        params: &Value,
    ) -> PublishReport {
        self.publish_json(targets, "params/local/init", params, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_group_params(
        &self,
        targets: Option<&[String]>,
        params: &Value,
    ) -> PublishReport {
        self.publish_json(targets, "params/local/group", params, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_ota_fetch(
        &self,
        targets: Option<&[String]>,
        fw_version: &str,
        network_id: Option<&str>,
    ) -> PublishReport {
        let mut payload = json!({ "fw_version": fw_version });
        if let Some(network_id) = network_id {
            payload["network_id"] = json!(network_id);
        }
        self.publish_json(targets, "otafetch", &payload, QoS::AtLeastOnce)
            .await
    }

    /// Report an OTA status for a job. The session layer forces QoS 0 on
    /// the `otastatus` suffix; each successfully notified node also drives
    /// the job store (a terminal status moves the job into History).
    pub async fn send_ota_status(
        &self,
        targets: Option<&[String]>,
        job_id: &str,
        status: OtaStatus,
    ) -> PublishReport {
        let payload = json!({
            "status": status.as_str(),
            "ota_job_id": job_id,
        });
        let report = self
            .publish_json(targets, "otastatus", &payload, QoS::AtMostOnce)
            .await;

        for (node_id, result) in &report.results {
            if result.is_ok() {
                self.ota.record_status(node_id, job_id, status);
            }
        }
        report
    }

    pub async fn send_tsdata(&self, targets: Option<&[String]>, payload: &Value) -> PublishReport {
        self.publish_json(targets, "tsdata", payload, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_simple_tsdata(
        &self,
        targets: Option<&[String]>,
        payload: &Value,
    ) -> PublishReport {
        self.publish_json(targets, "simple_tsdata", payload, QoS::AtLeastOnce)
            .await
    }

    pub async fn send_user_mapping(
        &self,
        targets: Option<&[String]>,
        user_id: &str,
        secret_key: &str,
        reset: bool,
        timeout: Option<u64>,
    ) -> PublishReport {
        let mut report = PublishReport::default();
        for node_id in self.resolve_targets(targets) {
            let payload = json!({
                "node_id": node_id,
                "user_id": user_id,
                "secret_key": secret_key,
                "reset": reset,
                "timeout": timeout,
            });
            let result = self
                .publish_with_retry(
                    &node_id,
                    "user/mapping",
                    payload.to_string().as_bytes(),
                    QoS::AtLeastOnce,
                )
                .await;
            report.results.insert(node_id, result);
        }
        report
    }

    pub async fn send_alert(&self, targets: Option<&[String]>, message: &str) -> PublishReport {
        let mut report = PublishReport::default();
        for node_id in self.resolve_targets(targets) {
            let payload = json!({
                "nodeId": node_id,
                "messageBody": { "message": message },
            });
            let result = self
                .publish_with_retry(
                    &node_id,
                    "alert",
                    payload.to_string().as_bytes(),
                    QoS::AtLeastOnce,
                )
                .await;
            report.results.insert(node_id, result);
        }
        report
    }

    /// Send a TLV command frame on `from-node`
    pub async fn send_command_frame(
        &self,
        targets: Option<&[String]>,
        frame: &CommandFrame,
    ) -> PublishReport {
        let payload = match serde_json::to_value(frame) {
            Ok(value) => value,
            Err(e) => {
                let mut report = PublishReport::default();
                for node_id in self.resolve_targets(targets) {
                    report.results.insert(
                        node_id,
                        Err(MqttError::PublishFailed(format!("bad frame: {e}"))),
                    );
                }
                return report;
            }
        };
        self.publish_json(targets, "from-node", &payload, QoS::AtLeastOnce)
            .await
    }

    /// Subscribe a node's inbound topics (`params/remote`, `otaurl`,
    /// `to-node`) and route messages into the stores, the monitor's
    /// activity record, and the optional sink.
    pub async fn attach_node(&self, node_id: &str, priority: i32) -> MqttResult<usize> {
        let handlers: Vec<(String, MessageHandler)> = DEFAULT_MONITOR_TOPICS
            .iter()
            .map(|suffix| (suffix.to_string(), self.handler_for(node_id, suffix)))
            .collect();
        self.subscriptions
            .subscribe_node_topics(node_id, handlers, priority)
            .await
    }

    fn handler_for(&self, node_id: &str, suffix: &'static str) -> MessageHandler {
        let node_id = node_id.to_string();
        let monitor = Arc::clone(&self.monitor);
        let ota = Arc::clone(&self.ota);
        let traces = Arc::clone(&self.traces);
        let sink = self.sink.clone();

        Arc::new(move |_topic, payload| {
            monitor.record_node_activity(&node_id, false);
            let data = parse_payload(payload);
            match suffix {
                "otaurl" => {
                    if let Err(e) = ota.ingest_url_response(&node_id, &data) {
                        warn!("{e}");
                    }
                }
                "params/remote" => traces.record_remote_params(&node_id, data),
                "to-node" => traces.record_node_response(&node_id, data),
                _ => debug!("No route for suffix {suffix}"),
            }
            if let Some(sink) = &sink {
                sink(&node_id, suffix, payload);
            }
        })
    }

    /// Drop a node's subscriptions, e.g. ahead of an operator-driven
    /// disconnect.
    pub async fn detach_node(&self, node_id: &str) -> usize {
        self.subscriptions.unsubscribe_node(node_id).await
    }
}

/// Inbound payloads are JSON when possible, preserved as a raw string
/// otherwise.
fn parse_payload(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
