use crate::{
    config::{ConfigStore, FleetConfig},
    identity::IdentityStore,
    monitor::{AdaptiveMonitor, MonitoringSummary},
    operator::{FleetOperator, MessageSink},
    ota_store::OtaJobStore,
    pool::{ConnectionPool, NodeStatusView},
    response_store::ResponseTraceStore,
    session::SessionFactory,
    session_store::SessionStateStore,
    subscription::{SelectiveSubscriptionManager, SubscriptionSummary},
    FleetError, FleetResult, MonitoringLevel, NodeIdentity,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Aggregate status snapshot for the operator's `status` verb
#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub session_id: i64,
    pub connected_nodes: usize,
    pub known_nodes: usize,
    pub nodes: BTreeMap<String, NodeStatusView>,
    pub monitoring: MonitoringSummary,
    pub subscriptions: SubscriptionSummary,
    pub active_ota_jobs: usize,
    pub completed_ota_jobs: usize,
}

/// The application value: explicit owner of the pool, monitor, stores and
/// the process-wide shutdown signal. Everything the surrounding shell
/// needs flows through here.
pub struct Fleet {
    config: FleetConfig,
    identities: IdentityStore,
    config_store: Arc<ConfigStore>,
    pool: Arc<ConnectionPool>,
    monitor: Arc<AdaptiveMonitor>,
    subscriptions: Arc<SelectiveSubscriptionManager>,
    ota: Arc<OtaJobStore>,
    traces: Arc<ResponseTraceStore>,
    session_book: Arc<SessionStateStore>,
    operator: Arc<FleetOperator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Fleet {
    /// Discover identities, bring up the fleet, and wire survivors into
    /// the monitor, subscription manager and session book.
    ///
    /// Fails when discovery yields zero nodes or bring-up yields zero
    /// connections; both are startup errors the process exits 1 on.
    pub async fn bootstrap(
        config: FleetConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Option<MessageSink>,
    ) -> FleetResult<Self> {
        std::fs::create_dir_all(&config.config_dir)?;

        let identities = IdentityStore::discover(&config.cert_paths, &config.config_dir)?;
        info!("Discovered {} nodes", identities.len());

        let config_store = Arc::new(ConfigStore::open(&config.config_dir));
        config_store.set_broker(&config.broker_url);
        config_store.set_cert_paths(&config.cert_paths);

        let cert_base = config
            .cert_paths
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let session_book = Arc::new(SessionStateStore::begin(
            &config.config_dir,
            &config.broker_url,
            &cert_base,
        ));
        let ota = Arc::new(OtaJobStore::open(&config.config_dir));
        let traces = Arc::new(ResponseTraceStore::open(&config.config_dir));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), factory));
        pool.start(shutdown_rx.clone());

        let all_identities: Vec<NodeIdentity> = identities.iter().cloned().collect();
        let (successful, total) = pool.connect_nodes(&all_identities).await;
        info!("Connected to {successful}/{total} nodes");
        if successful == 0 {
            pool.shutdown().await;
            session_book.end();
            return Err(FleetError::Startup(
                "no nodes connected successfully".to_string(),
            ));
        }

        let monitor = Arc::new(AdaptiveMonitor::new(
            config.monitor.clone(),
            pool.sessions_handle(),
            shutdown_rx,
        ));
        let subscriptions = Arc::new(SelectiveSubscriptionManager::new(
            config.max_subscriptions,
            pool.sessions_handle(),
        ));
        let operator = Arc::new(FleetOperator::new(
            Arc::clone(&pool),
            Arc::clone(&monitor),
            Arc::clone(&subscriptions),
            Arc::clone(&ota),
            Arc::clone(&traces),
            sink,
        ));

        let seed = monitor.config().high_priority_seed;
        for (index, node_id) in pool.connected_nodes().iter().enumerate() {
            if let Some(identity) = identities.get(node_id) {
                let cert = identity.cert_path.display().to_string();
                let key = identity.key_path.display().to_string();
                session_book.record_connect(node_id, &cert, &key);
                config_store.add_node(node_id, &identity.cert_path, &identity.key_path);
            }

            let level = if index < seed {
                MonitoringLevel::High
            } else {
                MonitoringLevel::Normal
            };
            monitor.add_node(node_id, level, None);

            if let Err(e) = operator.attach_node(node_id, 1).await {
                warn!("Subscriptions for {node_id} failed: {e}");
            }
        }

        Ok(Self {
            config,
            identities,
            config_store,
            pool,
            monitor,
            subscriptions,
            ota,
            traces,
            session_book,
            operator,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    pub fn operator(&self) -> &FleetOperator {
        &self.operator
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn monitor(&self) -> &AdaptiveMonitor {
        &self.monitor
    }

    pub fn ota(&self) -> &OtaJobStore {
        &self.ota
    }

    pub fn traces(&self) -> &ResponseTraceStore {
        &self.traces
    }

    pub fn session_book(&self) -> &SessionStateStore {
        &self.session_book
    }

    /// Gracefully disconnect some (or all Connected) nodes, with the
    /// session book stamped per node.
    pub async fn disconnect_nodes(&self, targets: Option<&[String]>) -> BTreeMap<String, bool> {
        let nodes = match targets {
            Some(list) => list.to_vec(),
            None => self.pool.connected_nodes(),
        };

        let mut results = BTreeMap::new();
        for node_id in nodes {
            self.operator.detach_node(&node_id).await;
            let disconnected = self.pool.disconnect_node(&node_id).await;
            if disconnected {
                self.session_book.record_disconnect(&node_id);
                self.monitor.remove_node(&node_id);
            }
            results.insert(node_id, disconnected);
        }
        results
    }

    pub fn status(&self) -> FleetStatus {
        let active = self.ota.active_jobs(None);
        let history = self.ota.history(None);
        FleetStatus {
            session_id: self.session_book.session_id(),
            connected_nodes: self.pool.connected_nodes().len(),
            known_nodes: self.identities.len(),
            nodes: self.pool.connection_stats(),
            monitoring: self.monitor.summary(),
            subscriptions: self.subscriptions.summary(),
            active_ota_jobs: active.values().map(|jobs| jobs.len()).sum(),
            completed_ota_jobs: history.values().map(|jobs| jobs.len()).sum(),
        }
    }

    /// Fast, silent shutdown: signal background tasks, stop the monitor,
    /// drain the pool with fire-and-forget disconnects, truncate the
    /// active session file. Bounded well under a second.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.monitor.stop();
        self.pool.shutdown().await;
        self.session_book.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSessionFactory;

    #[tokio::test]
    async fn test_bootstrap_fails_without_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::new(
            "mqtts://broker.example.com",
            vec![dir.path().join("empty-certs")],
            dir.path().join("state"),
        );
        let result = Fleet::bootstrap(config, Arc::new(MockSessionFactory::new()), None).await;
        assert!(matches!(result, Err(FleetError::Identity(_))));
    }
}
