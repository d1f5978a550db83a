use crate::{
    pool::SessionMap,
    session::MessageHandler,
    MqttError, MqttResult,
};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Default)]
struct SubState {
    by_node: HashMap<String, BTreeSet<String>>,
    priority: HashMap<(String, String), i32>,
}

impl SubState {
    fn total(&self) -> usize {
        self.by_node.values().map(|topics| topics.len()).sum()
    }

    fn is_active(&self, node_id: &str, suffix: &str) -> bool {
        self.by_node
            .get(node_id)
            .map(|topics| topics.contains(suffix))
            .unwrap_or(false)
    }

    fn record(&mut self, node_id: &str, suffix: &str, priority: i32) {
        self.by_node
            .entry(node_id.to_string())
            .or_default()
            .insert(suffix.to_string());
        self.priority
            .insert((node_id.to_string(), suffix.to_string()), priority);
    }

    fn remove(&mut self, node_id: &str, suffix: &str) {
        if let Some(topics) = self.by_node.get_mut(node_id) {
            topics.remove(suffix);
            if topics.is_empty() {
                self.by_node.remove(node_id);
            }
        }
        self.priority
            .remove(&(node_id.to_string(), suffix.to_string()));
    }

    /// Lowest-priority active subscriptions, enough to free `needed` slots
    fn eviction_candidates(&self, needed: usize) -> Vec<(String, String)> {
        let mut entries: Vec<(&(String, String), &i32)> = self.priority.iter().collect();
        entries.sort_by_key(|(key, priority)| (**priority, (*key).clone()));
        entries
            .into_iter()
            .take(needed)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Summary of subscription slot usage
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub total_subscriptions: usize,
    pub max_subscriptions: Option<usize>,
    pub nodes_with_subscriptions: usize,
}

/// Priority-ordered topic subscriptions under an optional global slot cap.
///
/// When the cap would be exceeded, the lowest-priority subscriptions are
/// evicted fleet-wide until enough room exists. All subscribes use QoS 0.
pub struct SelectiveSubscriptionManager {
    max_subscriptions: Option<usize>,
    sessions: SessionMap,
    state: Mutex<SubState>,
}

impl SelectiveSubscriptionManager {
    pub fn new(max_subscriptions: Option<usize>, sessions: SessionMap) -> Self {
        Self {
            max_subscriptions,
            sessions,
            state: Mutex::new(SubState::default()),
        }
    }

    /// Subscribe a node to the given topic suffixes at the given priority.
    ///
    /// Already-active `(node, suffix)` pairs are skipped. On a broker-side
    /// subscribe failure the node's remaining topics in this call are
    /// abandoned; subscriptions made so far stay active.
    pub async fn subscribe_node_topics(
        &self,
        node_id: &str,
        topics: Vec<(String, MessageHandler)>,
        priority: i32,
    ) -> MqttResult<usize> {
        let session = self
            .sessions
            .read()
            .get(node_id)
            .cloned()
            .ok_or(MqttError::NotConnected)?;

        let to_add: Vec<(String, MessageHandler)> = {
            let state = self.state.lock();
            topics
                .into_iter()
                .filter(|(suffix, _)| !state.is_active(node_id, suffix))
                .collect()
        };
        if to_add.is_empty() {
            return Ok(0);
        }

        if let Some(max) = self.max_subscriptions {
            let evictions = {
                let state = self.state.lock();
                let total = state.total();
                if total + to_add.len() > max {
                    state.eviction_candidates(total + to_add.len() - max)
                } else {
                    Vec::new()
                }
            };
            for (evict_node, suffix) in evictions {
                self.evict(&evict_node, &suffix).await;
            }
        }

        let mut added = 0;
        for (suffix, handler) in to_add {
            let topic = format!("node/{node_id}/{suffix}");
            session
                .subscribe(&topic, QoS::AtMostOnce, handler)
                .await
                .map_err(|e| {
                    warn!("Failed to subscribe to {topic}: {e}");
                    e
                })?;
            self.state.lock().record(node_id, &suffix, priority);
            debug!("Subscribed to {topic}");
            added += 1;
        }
        Ok(added)
    }

    async fn evict(&self, node_id: &str, suffix: &str) {
        let session = self.sessions.read().get(node_id).cloned();
        if let Some(session) = session {
            let topic = format!("node/{node_id}/{suffix}");
            if let Err(e) = session.unsubscribe(&topic).await {
                debug!("Eviction unsubscribe for {topic} failed: {e}");
            }
        }
        self.state.lock().remove(node_id, suffix);
        debug!("Evicted low priority subscription node/{node_id}/{suffix}");
    }

    /// Drop all of a node's subscriptions, unsubscribing on the session
    /// when it is still live. Returns how many were removed.
    pub async fn unsubscribe_node(&self, node_id: &str) -> usize {
        let suffixes: Vec<String> = {
            let state = self.state.lock();
            state
                .by_node
                .get(node_id)
                .map(|topics| topics.iter().cloned().collect())
                .unwrap_or_default()
        };
        for suffix in &suffixes {
            self.evict(node_id, suffix).await;
        }
        suffixes.len()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.state.lock().total()
    }

    pub fn node_topics(&self, node_id: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .by_node
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn summary(&self) -> SubscriptionSummary {
        let state = self.state.lock();
        SubscriptionSummary {
            total_subscriptions: state.total(),
            max_subscriptions: self.max_subscriptions,
            nodes_with_subscriptions: state.by_node.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockSession, NodeSession};
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn noop() -> MessageHandler {
        Arc::new(|_, _| {})
    }

    async fn fixture(node_ids: &[&str]) -> (SessionMap, Vec<Arc<MockSession>>) {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let mut mocks = Vec::new();
        for node_id in node_ids {
            let mock = MockSession::new(*node_id);
            mock.connect().await.unwrap();
            sessions
                .write()
                .insert(node_id.to_string(), mock.clone() as Arc<dyn NodeSession>);
            mocks.push(mock);
        }
        (sessions, mocks)
    }

    fn topics(suffixes: &[&str]) -> Vec<(String, MessageHandler)> {
        suffixes.iter().map(|s| (s.to_string(), noop())).collect()
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe_round_trip() {
        let (sessions, mocks) = fixture(&["n1"]).await;
        let manager = SelectiveSubscriptionManager::new(None, sessions);

        let added = manager
            .subscribe_node_topics("n1", topics(&["params/remote", "otaurl", "to-node"]), 1)
            .await
            .unwrap();
        assert_eq!(added, 3);
        assert_eq!(manager.total_subscriptions(), 3);
        assert_eq!(mocks[0].subscribed_topics().len(), 3);

        let removed = manager.unsubscribe_node("n1").await;
        assert_eq!(removed, 3);
        assert_eq!(manager.total_subscriptions(), 0);
        assert!(manager.node_topics("n1").is_empty());
        assert!(mocks[0].subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscription_is_skipped() {
        let (sessions, _mocks) = fixture(&["n1"]).await;
        let manager = SelectiveSubscriptionManager::new(None, sessions);

        manager
            .subscribe_node_topics("n1", topics(&["otaurl"]), 1)
            .await
            .unwrap();
        let added = manager
            .subscribe_node_topics("n1", topics(&["otaurl"]), 2)
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(manager.total_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_cap_evicts_lowest_priority_globally() {
        let (sessions, mocks) = fixture(&["low", "high"]).await;
        let manager = SelectiveSubscriptionManager::new(Some(4), sessions);

        manager
            .subscribe_node_topics("low", topics(&["params/remote", "otaurl", "to-node"]), 1)
            .await
            .unwrap();
        let added = manager
            .subscribe_node_topics("high", topics(&["params/remote", "otaurl", "to-node"]), 5)
            .await
            .unwrap();

        assert_eq!(added, 3);
        assert_eq!(manager.total_subscriptions(), 4);
        assert_eq!(manager.node_topics("high").len(), 3);
        assert_eq!(manager.node_topics("low").len(), 1);
        // The evicted topics were really unsubscribed on the session
        assert_eq!(mocks[0].subscribed_topics().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_rejected() {
        let (sessions, _mocks) = fixture(&[]).await;
        let manager = SelectiveSubscriptionManager::new(None, sessions);
        let result = manager
            .subscribe_node_topics("ghost", topics(&["otaurl"]), 1)
            .await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_summary() {
        let (sessions, _mocks) = fixture(&["n1", "n2"]).await;
        let manager = SelectiveSubscriptionManager::new(Some(10), sessions);
        manager
            .subscribe_node_topics("n1", topics(&["otaurl"]), 1)
            .await
            .unwrap();
        manager
            .subscribe_node_topics("n2", topics(&["otaurl", "to-node"]), 1)
            .await
            .unwrap();

        let summary = manager.summary();
        assert_eq!(summary.total_subscriptions, 3);
        assert_eq!(summary.max_subscriptions, Some(10));
        assert_eq!(summary.nodes_with_subscriptions, 2);
    }
}
