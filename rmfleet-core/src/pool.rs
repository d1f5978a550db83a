use crate::{
    identity::NodeIdentity,
    session::{NodeSession, SessionFactory},
    ConnectionStats, SessionState,
};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Pause between bring-up batches to smooth broker load
const INTER_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Connection pool configuration. A value of 0 for the connection caps and
/// batch size means unlimited.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on in-flight connect calls, 0 = unlimited
    pub max_concurrent_connections: usize,
    /// Maximum connect attempts per second, 0 = unlimited
    pub connection_rate_limit: usize,
    /// Bring-up group size, 0 = single pass over all nodes
    pub batch_size: usize,
    /// Consecutive failures that open the circuit breaker
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker blocks reconnect attempts
    pub circuit_breaker_timeout: Duration,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    /// Background health sweep cadence
    pub health_check_interval: Duration,
    /// Connected sessions probed per sweep, 0 = all
    pub health_sweep_batch: usize,
    /// Connect attempts per bring-up call
    pub max_retries: u32,
    pub retry_backoff_base: f64,
    pub jitter_range: f64,
    /// Broker keep-alive period used by sessions
    pub esp_keepalive_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 0,
            connection_rate_limit: 0,
            batch_size: 0,
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout: Duration::from_secs(120),
            connection_timeout: Duration::from_secs(8),
            operation_timeout: Duration::from_secs(6),
            health_check_interval: Duration::from_secs(25),
            health_sweep_batch: 10,
            max_retries: 2,
            retry_backoff_base: 1.5,
            jitter_range: 0.2,
            esp_keepalive_time: Duration::from_secs(20),
        }
    }
}

/// Per-node bookkeeping: lifecycle state, counters, breaker timer.
/// Single writer (the pool); readers get snapshots.
#[derive(Debug)]
struct NodeRecord {
    state: SessionState,
    stats: ConnectionStats,
    breaker_opened: Option<Instant>,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            stats: ConnectionStats::default(),
            breaker_opened: None,
        }
    }
}

/// Snapshot of a node's connection status for operator display
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusView {
    pub state: SessionState,
    pub attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub uptime_secs: Option<u64>,
}

/// Map of live sessions shared with the monitor, subscription manager and
/// facade. The pool is the only writer.
pub type SessionMap = Arc<RwLock<HashMap<String, Arc<dyn NodeSession>>>>;

/// Rate-limited, circuit-breaker-protected pool of node sessions.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    sessions: SessionMap,
    records: Arc<RwLock<HashMap<String, NodeRecord>>>,
    connect_semaphore: Option<Arc<Semaphore>>,
    rate_limiter: Option<Arc<Semaphore>>,
    refill_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let connect_semaphore = (config.max_concurrent_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_connections)));
        let rate_limiter = (config.connection_rate_limit > 0)
            .then(|| Arc::new(Semaphore::new(config.connection_rate_limit)));

        Self {
            config,
            factory,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
            connect_semaphore,
            rate_limiter,
            refill_task: Mutex::new(None),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start the background rate-limiter refill and health sweep tasks.
    /// Both observe the shutdown signal between iterations.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        if let Some(limiter) = self.rate_limiter.clone() {
            let capacity = self.config.connection_rate_limit;
            let mut rx = shutdown.clone();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sleep(Duration::from_secs(1)) => {
                            let available = limiter.available_permits();
                            if available < capacity {
                                limiter.add_permits(capacity - available);
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            });
            *self.refill_task.lock() = Some(task);
        }

        let sessions = Arc::clone(&self.sessions);
        let records = Arc::clone(&self.records);
        let interval = self.config.health_check_interval;
        let sweep_batch = self.config.health_sweep_batch;
        let mut rx = shutdown;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {
                        Self::perform_health_checks(&sessions, &records, sweep_batch).await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.health_task.lock() = Some(task);
        debug!("Connection pool started");
    }

    /// Bring up the given nodes under the configured rate and concurrency
    /// budgets. Returns `(successful, total)`. Completion order across
    /// nodes is not guaranteed.
    pub async fn connect_nodes(&self, identities: &[NodeIdentity]) -> (usize, usize) {
        let total = identities.len();
        if total == 0 {
            return (0, 0);
        }

        let mut successful = 0;
        if self.config.batch_size > 0 {
            for (i, batch) in identities.chunks(self.config.batch_size).enumerate() {
                if i > 0 {
                    sleep(INTER_BATCH_PAUSE).await;
                }
                successful += self.connect_batch(batch).await;
            }
        } else {
            successful = self.connect_batch(identities).await;
        }

        (successful, total)
    }

    async fn connect_batch(&self, batch: &[NodeIdentity]) -> usize {
        let attempts: Vec<_> = batch
            .iter()
            .map(|identity| self.connect_single(identity))
            .collect();
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    async fn connect_single(&self, identity: &NodeIdentity) -> bool {
        if !self.should_attempt_connection(&identity.node_id) {
            return false;
        }

        // One token per attempt per second, regenerated by the refill task
        if let Some(limiter) = &self.rate_limiter {
            match limiter.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return false,
            }
        }

        let _slot = match &self.connect_semaphore {
            Some(semaphore) => match semaphore.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => return false,
            },
            None => None,
        };

        self.do_connection(identity).await
    }

    async fn do_connection(&self, identity: &NodeIdentity) -> bool {
        let node_id = identity.node_id.clone();
        self.with_record(&node_id, |r| r.state = SessionState::Connecting);

        let session = self.factory.create(identity);
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            self.with_record(&node_id, |r| {
                r.stats.attempts += 1;
                r.stats.last_attempt = Some(Instant::now());
            });

            let breaker_opened = match timeout(self.config.connection_timeout, session.connect())
                .await
            {
                Ok(Ok(())) => {
                    self.with_record(&node_id, |r| {
                        r.state = SessionState::Connected;
                        r.stats.successful += 1;
                        r.stats.consecutive_failures = 0;
                        r.stats.last_success = Some(Instant::now());
                        r.stats.connect_start = Some(Instant::now());
                        r.breaker_opened = None;
                    });
                    self.sessions
                        .write()
                        .insert(node_id.clone(), Arc::clone(&session));
                    info!("✓ Connected to {node_id}");
                    return true;
                }
                Ok(Err(e)) => {
                    // Only the first attempt is worth a visible line
                    if attempt == 0 {
                        warn!("Connection error for {node_id} (attempt 1): {e}");
                    } else {
                        debug!("Connection error for {node_id} (attempt {}): {e}", attempt + 1);
                    }
                    self.record_connect_failure(&node_id)
                }
                Err(_) => {
                    if attempt == 0 {
                        warn!("Connection timeout for {node_id} (attempt 1)");
                    } else {
                        debug!("Connection timeout for {node_id} (attempt {})", attempt + 1);
                    }
                    self.record_connect_failure(&node_id)
                }
            };

            if breaker_opened {
                return false;
            }
            if attempt + 1 < attempts {
                sleep(backoff_delay(&self.config, attempt)).await;
            }
        }

        self.with_record(&node_id, |r| {
            if r.state == SessionState::Connecting {
                r.state = SessionState::Failed;
            }
        });
        false
    }

    /// Breaker gate: an open breaker blocks attempts until its timer
    /// expires, at which point the node returns to Disconnected.
    fn should_attempt_connection(&self, node_id: &str) -> bool {
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_default();
        match record.state {
            SessionState::CircuitOpen => {
                if let Some(opened) = record.breaker_opened {
                    if opened.elapsed() > self.config.circuit_breaker_timeout {
                        record.state = SessionState::Disconnected;
                        record.breaker_opened = None;
                        return true;
                    }
                }
                false
            }
            SessionState::Disconnected | SessionState::Failed => true,
            SessionState::Connecting | SessionState::Connected => false,
        }
    }

    /// Returns true when the failure opened the breaker
    fn record_connect_failure(&self, node_id: &str) -> bool {
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_default();
        record.stats.failed += 1;
        record.stats.consecutive_failures += 1;

        if record.stats.consecutive_failures >= self.config.circuit_breaker_threshold {
            record.state = SessionState::CircuitOpen;
            record.breaker_opened = Some(Instant::now());
            warn!("Circuit breaker opened for {node_id}");
            true
        } else {
            false
        }
    }

    fn with_record<R>(&self, node_id: &str, f: impl FnOnce(&mut NodeRecord) -> R) -> R {
        let mut records = self.records.write();
        f(records.entry(node_id.to_string()).or_default())
    }

    async fn perform_health_checks(
        sessions: &SessionMap,
        records: &Arc<RwLock<HashMap<String, NodeRecord>>>,
        sweep_batch: usize,
    ) {
        let targets: Vec<Arc<dyn NodeSession>> = {
            let map = sessions.read();
            let count = if sweep_batch == 0 { map.len() } else { sweep_batch };
            map.values().take(count).cloned().collect()
        };

        for session in targets {
            if !session.is_connected().await {
                let node_id = session.node_id().to_string();
                warn!("Health check failed for {node_id}");
                sessions.write().remove(&node_id);
                if let Some(record) = records.write().get_mut(&node_id) {
                    record.state = SessionState::Failed;
                    record.stats.connect_start = None;
                }
            }
        }
    }

    pub fn get_session(&self, node_id: &str) -> Option<Arc<dyn NodeSession>> {
        self.sessions.read().get(node_id).cloned()
    }

    /// Handle to the live sessions map for read-only collaborators
    pub fn sessions_handle(&self) -> SessionMap {
        Arc::clone(&self.sessions)
    }

    /// Currently Connected node ids, sorted for deterministic iteration
    pub fn connected_nodes(&self) -> Vec<String> {
        let records = self.records.read();
        let mut nodes: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.state == SessionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn node_state(&self, node_id: &str) -> SessionState {
        self.records
            .read()
            .get(node_id)
            .map(|r| r.state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn connection_stats(&self) -> BTreeMap<String, NodeStatusView> {
        self.records
            .read()
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    NodeStatusView {
                        state: r.state,
                        attempts: r.stats.attempts,
                        successful: r.stats.successful,
                        failed: r.stats.failed,
                        consecutive_failures: r.stats.consecutive_failures,
                        uptime_secs: if r.state == SessionState::Connected {
                            r.stats.uptime().map(|d| d.as_secs())
                        } else {
                            None
                        },
                    },
                )
            })
            .collect()
    }

    /// An unrecoverable publish failure takes the node out of the live map
    pub fn record_publish_failure(&self, node_id: &str) {
        self.sessions.write().remove(node_id);
        self.with_record(node_id, |r| {
            if r.state == SessionState::Connected {
                r.state = SessionState::Failed;
                r.stats.connect_start = None;
            }
        });
    }

    /// Operator-driven graceful disconnect of one node
    pub async fn disconnect_node(&self, node_id: &str) -> bool {
        let session = self.sessions.write().remove(node_id);
        match session {
            Some(session) => {
                session.disconnect().await;
                self.with_record(node_id, |r| {
                    r.state = SessionState::Disconnected;
                    r.stats.connect_start = None;
                });
                true
            }
            None => false,
        }
    }

    /// Fast shutdown: background tasks stop, the live map empties, and
    /// disconnects run fire-and-forget so exit is never blocked on the
    /// broker. Disconnect noise never reaches the logs.
    pub async fn shutdown(&self) {
        if let Some(task) = self.refill_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        let drained: Vec<(String, Arc<dyn NodeSession>)> =
            self.sessions.write().drain().collect();
        {
            let mut records = self.records.write();
            for record in records.values_mut() {
                record.state = SessionState::Disconnected;
                record.stats.connect_start = None;
            }
        }
        for (_, session) in drained {
            tokio::spawn(async move {
                session.disconnect().await;
            });
        }
    }
}

fn backoff_delay(config: &PoolConfig, attempt: u32) -> Duration {
    let base = config.retry_backoff_base.max(0.0).powi(attempt as i32);
    let jitter = if config.jitter_range > 0.0 {
        rand::rng().random_range(0.0..config.jitter_range)
    } else {
        0.0
    };
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSessionFactory;

    fn identity(node_id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: node_id.to_string(),
            cert_path: "node.crt".into(),
            key_path: "node.key".into(),
            root_ca_path: "root.pem".into(),
        }
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            connection_timeout: Duration::from_millis(200),
            retry_backoff_base: 0.0,
            jitter_range: 0.0,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_zero_nodes_is_a_no_op() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = ConnectionPool::new(fast_config(), factory.clone());
        assert_eq!(pool.connect_nodes(&[]).await, (0, 0));
        assert!(factory.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_bring_up_connects_all_nodes() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = ConnectionPool::new(fast_config(), factory.clone());
        let nodes = vec![identity("n1"), identity("n2"), identity("n3")];

        assert_eq!(pool.connect_nodes(&nodes).await, (3, 3));
        assert_eq!(pool.connected_nodes(), vec!["n1", "n2", "n3"]);
        assert_eq!(pool.node_state("n2"), SessionState::Connected);
        assert!(pool.get_session("n3").is_some());
    }

    #[tokio::test]
    async fn test_batched_bring_up() {
        let factory = Arc::new(MockSessionFactory::new());
        let mut config = fast_config();
        config.batch_size = 2;
        let pool = ConnectionPool::new(config, factory);
        let nodes: Vec<_> = (1..=5).map(|i| identity(&format!("n{i}"))).collect();

        assert_eq!(pool.connect_nodes(&nodes).await, (5, 5));
        assert_eq!(pool.connected_nodes().len(), 5);
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold() {
        let factory = Arc::new(MockSessionFactory::new());
        factory.mark_always_fail("bad");
        let mut config = fast_config();
        config.circuit_breaker_threshold = 2;
        config.max_retries = 2;
        let pool = ConnectionPool::new(config, factory.clone());

        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(pool.node_state("bad"), SessionState::CircuitOpen);
        assert_eq!(factory.session("bad").unwrap().connect_attempts(), 2);

        // Open breaker blocks the next bring-up entirely
        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(factory.session("bad").unwrap().connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_below_threshold_leave_failed() {
        let factory = Arc::new(MockSessionFactory::new());
        factory.mark_always_fail("bad");
        let mut config = fast_config();
        config.circuit_breaker_threshold = 5;
        config.max_retries = 2;
        let pool = ConnectionPool::new(config, factory.clone());

        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(pool.node_state("bad"), SessionState::Failed);

        // Failed nodes stay retryable
        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(factory.session("bad").unwrap().connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_breaker_cooldown_allows_retry() {
        let factory = Arc::new(MockSessionFactory::new());
        factory.mark_always_fail("bad");
        let mut config = fast_config();
        config.circuit_breaker_threshold = 1;
        config.max_retries = 1;
        config.circuit_breaker_timeout = Duration::ZERO;
        let pool = ConnectionPool::new(config, factory.clone());

        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(pool.node_state("bad"), SessionState::CircuitOpen);

        // Timer already expired, so the breaker half-closes and a fresh
        // attempt goes through
        assert_eq!(pool.connect_nodes(&[identity("bad")]).await, (0, 1));
        assert_eq!(factory.session("bad").unwrap().connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_removes_from_live_map() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = ConnectionPool::new(fast_config(), factory);
        pool.connect_nodes(&[identity("n1")]).await;

        pool.record_publish_failure("n1");
        assert!(pool.get_session("n1").is_none());
        assert_eq!(pool.node_state("n1"), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_node() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = ConnectionPool::new(fast_config(), factory.clone());
        pool.connect_nodes(&[identity("n1")]).await;

        assert!(pool.disconnect_node("n1").await);
        assert!(!pool.disconnect_node("n1").await);
        assert_eq!(pool.node_state("n1"), SessionState::Disconnected);
        assert!(!factory.session("n1").unwrap().is_connected().await);
    }

    #[tokio::test]
    async fn test_shutdown_clears_sessions_and_states() {
        let factory = Arc::new(MockSessionFactory::new());
        let pool = ConnectionPool::new(fast_config(), factory);
        let nodes: Vec<_> = (1..=4).map(|i| identity(&format!("n{i}"))).collect();
        pool.connect_nodes(&nodes).await;

        let (_tx, rx) = watch::channel(false);
        pool.start(rx);
        pool.shutdown().await;

        assert!(pool.connected_nodes().is_empty());
        for i in 1..=4 {
            assert_eq!(
                pool.node_state(&format!("n{i}")),
                SessionState::Disconnected
            );
        }
    }

    #[tokio::test]
    async fn test_stats_track_attempts_and_failures() {
        let factory = Arc::new(MockSessionFactory::new());
        factory.mark_always_fail("bad");
        let mut config = fast_config();
        config.circuit_breaker_threshold = 10;
        config.max_retries = 3;
        let pool = ConnectionPool::new(config, factory);

        pool.connect_nodes(&[identity("bad"), identity("good")]).await;
        let stats = pool.connection_stats();

        assert_eq!(stats["bad"].attempts, 3);
        assert_eq!(stats["bad"].failed, 3);
        assert_eq!(stats["bad"].consecutive_failures, 3);
        assert_eq!(stats["good"].successful, 1);
        assert!(stats["good"].uptime_secs.is_some());
        assert!(stats["bad"].uptime_secs.is_none());
    }
}
