use crate::{identity::NodeIdentity, pool::PoolConfig, MqttError, MqttResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Callback for messages arriving on a subscribed topic.
/// Receives `(topic, raw payload)`; JSON parsing is the handler's business.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Delay between the disconnect and connect halves of a reconnect
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a queued DISCONNECT gets to flush before the event loop is dropped
const DISCONNECT_FLUSH_WAIT: Duration = Duration::from_millis(250);

/// Capacity of the rumqttc request channel between client and event loop
const REQUEST_QUEUE_CAPACITY: usize = 10;

/// Per-node MQTT session contract.
///
/// `connect`/`disconnect`/`reconnect` are serialized per session;
/// `publish`/`subscribe` may be called concurrently.
#[async_trait]
pub trait NodeSession: Send + Sync {
    fn node_id(&self) -> &str;

    async fn connect(&self) -> MqttResult<()>;

    /// Best-effort and idempotent; broker-side disconnect noise never
    /// surfaces to the caller.
    async fn disconnect(&self);

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    async fn subscribe(&self, topic: &str, qos: QoS, handler: MessageHandler) -> MqttResult<()>;

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()>;

    /// Cached liveness; at most one live probe per ping interval.
    async fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> MqttResult<()>;
}

/// Builds sessions for the pool; swapped for a mock factory in tests.
pub trait SessionFactory: Send + Sync {
    fn create(&self, identity: &NodeIdentity) -> Arc<dyn NodeSession>;
}

/// Transport settings shared by every session of a fleet
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub broker_host: String,
    pub broker_port: u16,
    /// Broker keep-alive period (20 s for RainMaker-style brokers)
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    /// Minimum spacing between live probes; strictly greater than the
    /// broker keep-alive so probes stay rare.
    pub ping_interval: Duration,
    pub probe_timeout: Duration,
}

impl SessionConfig {
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port,
            keep_alive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(8),
            operation_timeout: Duration::from_secs(6),
            ping_interval: Duration::from_secs(45),
            probe_timeout: Duration::from_secs(2),
        }
    }

    /// Derive session deadlines from the pool configuration
    pub fn from_pool(broker_host: impl Into<String>, broker_port: u16, pool: &PoolConfig) -> Self {
        let mut config = Self::new(broker_host, broker_port);
        config.keep_alive = pool.esp_keepalive_time;
        config.connect_timeout = pool.connection_timeout;
        config.operation_timeout = pool.operation_timeout;
        config
    }
}

/// QoS actually sent for a topic: `otastatus` publishes are forced to
/// QoS 0 so status floods never wait for acknowledgment.
pub fn effective_qos(topic: &str, qos: QoS) -> QoS {
    match topic.rsplit('/').next() {
        Some("otastatus") => QoS::AtMostOnce,
        _ => qos,
    }
}

/// Rate gate for liveness probes: `due()` says whether the cached state
/// has aged past the ping interval.
struct ProbeGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProbeGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn due(&self) -> bool {
        match *self.last.lock() {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        }
    }

    fn record(&self) {
        *self.last.lock() = Some(Instant::now());
    }
}

/// MQTT+TLS session for a single impersonated node, backed by a rumqttc
/// async client with its own event-loop task.
pub struct MqttSession {
    identity: NodeIdentity,
    config: SessionConfig,
    client: RwLock<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    transport_failed: Arc<AtomicBool>,
    probe_gate: ProbeGate,
    handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl MqttSession {
    pub fn new(identity: NodeIdentity, config: SessionConfig) -> Self {
        let ping_interval = config.ping_interval;
        Self {
            identity,
            config,
            client: RwLock::new(None),
            event_task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            transport_failed: Arc::new(AtomicBool::new(false)),
            probe_gate: ProbeGate::new(ping_interval),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn create_mqtt_options(&self) -> MqttResult<MqttOptions> {
        let client_id = format!("{}-{}", self.identity.node_id, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(
            client_id,
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_transport(Transport::Tls(build_tls_config(&self.identity)?));
        Ok(options)
    }

    async fn connect_inner(&self) -> MqttResult<()> {
        if self.connected.load(Ordering::SeqCst) && self.client.read().is_some() {
            return Ok(());
        }

        let options = self.create_mqtt_options()?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        self.connected.store(false, Ordering::SeqCst);
        self.transport_failed.store(false, Ordering::SeqCst);

        let task = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.identity.node_id.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.transport_failed),
            Arc::clone(&self.handlers),
        ));
        if let Some(old) = self.event_task.lock().replace(task) {
            old.abort();
        }
        *self.client.write() = Some(client);

        // Wait for the event loop to see the broker's ConnAck
        let start = Instant::now();
        while start.elapsed() < self.config.connect_timeout {
            if self.connected.load(Ordering::SeqCst) {
                self.probe_gate.record();
                return Ok(());
            }
            if self.transport_failed.load(Ordering::SeqCst) {
                self.teardown().await;
                return Err(MqttError::ConnectFailed(format!(
                    "broker rejected session for {}",
                    self.identity.node_id
                )));
            }
            sleep(Duration::from_millis(50)).await;
        }

        self.teardown().await;
        Err(MqttError::ConnectTimeout(self.config.connect_timeout))
    }

    async fn disconnect_inner(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let client = self.client.write().take();
        if let Some(client) = client {
            // The event loop is still polling, so a queued DISCONNECT gets
            // a short window to reach the wire; any error is swallowed.
            let _ = timeout(DISCONNECT_FLUSH_WAIT, client.disconnect()).await;
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }

    async fn teardown(&self) {
        *self.client.write() = None;
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.client.read().clone()
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        node_id: String,
        connected: Arc<AtomicBool>,
        transport_failed: Arc<AtomicBool>,
        handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        debug!("Broker session established for {node_id}");
                        connected.store(true, Ordering::SeqCst);
                    } else {
                        warn!("Broker rejected {node_id}: {:?}", ack.code);
                        connected.store(false, Ordering::SeqCst);
                        transport_failed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let handler = handlers.read().get(&publish.topic).cloned();
                    match handler {
                        Some(handler) => handler(&publish.topic, &publish.payload),
                        None => debug!("Unhandled message on {}", publish.topic),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    // Broker-side disconnects stay at debug: shutdown must
                    // never raise disconnect noise into visible logs
                    debug!("Broker disconnected {node_id}");
                    connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Transport for {node_id} ended: {e}");
                    connected.store(false, Ordering::SeqCst);
                    transport_failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl NodeSession for MqttSession {
    fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    async fn connect(&self) -> MqttResult<()> {
        let _guard = self.connect_lock.lock().await;
        self.connect_inner().await
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.disconnect_inner().await;
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        let qos = effective_qos(topic, qos);
        let client = self.current_client().ok_or(MqttError::NotConnected)?;

        timeout(
            self.config.operation_timeout,
            client.publish(topic, qos, false, payload.to_vec()),
        )
        .await
        .map_err(|_| MqttError::PublishFailed(format!("publish to {topic} timed out")))?
        .map_err(|e| MqttError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS, handler: MessageHandler) -> MqttResult<()> {
        let client = self.current_client().ok_or(MqttError::NotConnected)?;
        self.handlers.write().insert(topic.to_string(), handler);

        let result = timeout(self.config.operation_timeout, client.subscribe(topic, qos))
            .await
            .map_err(|_| MqttError::SubscribeFailed(format!("subscribe to {topic} timed out")))
            .and_then(|r| r.map_err(|e| MqttError::SubscribeFailed(e.to_string())));

        if result.is_err() {
            self.handlers.write().remove(topic);
        }
        result
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        self.handlers.write().remove(topic);
        let client = self.current_client().ok_or(MqttError::NotConnected)?;
        timeout(self.config.operation_timeout, client.unsubscribe(topic))
            .await
            .map_err(|_| MqttError::SubscribeFailed(format!("unsubscribe from {topic} timed out")))?
            .map_err(|e| MqttError::SubscribeFailed(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if !self.probe_gate.due() {
            return true;
        }

        // Zero-length QoS 0 publish to a sentinel topic; any transport
        // error marks the session failed until the next reconnect.
        let Some(client) = self.current_client() else {
            return false;
        };
        let probe_topic = format!("$aws/things/{}/ping", self.identity.node_id);
        match timeout(
            self.config.probe_timeout,
            client.publish(probe_topic, QoS::AtMostOnce, false, Vec::new()),
        )
        .await
        {
            Ok(Ok(())) => {
                self.probe_gate.record();
                true
            }
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    async fn reconnect(&self) -> MqttResult<()> {
        let _guard = self.connect_lock.lock().await;
        self.disconnect_inner().await;
        sleep(RECONNECT_DELAY).await;
        self.connect_inner().await
    }
}

/// Build a mutual-auth TLS configuration from the node's certificate
/// material.
fn build_tls_config(identity: &NodeIdentity) -> MqttResult<TlsConfiguration> {
    let cert_file = std::fs::read(&identity.cert_path)
        .map_err(|e| MqttError::Configuration(format!("Failed to read certificate: {e}")))?;
    let cert_chain = rustls_pemfile::certs(&mut cert_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MqttError::Configuration(format!("Failed to parse certificate: {e}")))?;

    let key_file = std::fs::read(&identity.key_path)
        .map_err(|e| MqttError::Configuration(format!("Failed to read private key: {e}")))?;
    let private_key = rustls_pemfile::private_key(&mut key_file.as_slice())
        .map_err(|e| MqttError::Configuration(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| MqttError::Configuration("No private key found".to_string()))?;

    let ca_file = std::fs::read(&identity.root_ca_path)
        .map_err(|e| MqttError::Configuration(format!("Failed to read root CA: {e}")))?;
    let mut root_cert_store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_file.as_slice()) {
        let cert =
            cert.map_err(|e| MqttError::Configuration(format!("Failed to parse root CA: {e}")))?;
        root_cert_store
            .add(cert)
            .map_err(|e| MqttError::Configuration(format!("Failed to add root CA: {e}")))?;
    }

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|e| MqttError::Configuration(format!("Failed to create TLS config: {e}")))?;

    Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
}

/// Builds `MqttSession`s against a fixed broker endpoint
pub struct MqttSessionFactory {
    config: SessionConfig,
}

impl MqttSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for MqttSessionFactory {
    fn create(&self, identity: &NodeIdentity) -> Arc<dyn NodeSession> {
        Arc::new(MqttSession::new(identity.clone(), self.config.clone()))
    }
}

/// Mock session for testing. Mirrors the `NodeSession` contract, including
/// the forced QoS 0 on `otastatus` topics, without touching the network.
pub struct MockSession {
    node_id: String,
    connected: AtomicBool,
    always_fail_connect: AtomicBool,
    fail_connects_remaining: std::sync::atomic::AtomicU32,
    fail_publish: AtomicBool,
    connect_attempts: std::sync::atomic::AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    connect_times: Mutex<Vec<Instant>>,
    published: Mutex<Vec<(String, Vec<u8>, QoS)>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
}

impl MockSession {
    pub fn new(node_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            connected: AtomicBool::new(false),
            always_fail_connect: AtomicBool::new(false),
            fail_connects_remaining: std::sync::atomic::AtomicU32::new(0),
            fail_publish: AtomicBool::new(false),
            connect_attempts: std::sync::atomic::AtomicU32::new(0),
            connect_delay: Mutex::new(None),
            connect_times: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_always_fail_connect(&self, fail: bool) {
        self.always_fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` connect calls, then succeed
    pub fn script_connect_failures(&self, n: u32) {
        self.fail_connects_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make connect calls take this long, for concurrency and pacing tests
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Simulate a silently dropped transport: the cached flag goes false
    /// as a probe would discover.
    pub fn drop_transport(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, QoS)> {
        self.published.lock().clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver a payload to the registered handler for `topic`
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let handler = self.handlers.lock().get(topic).cloned();
        if let Some(handler) = handler {
            handler(topic, payload);
        }
    }
}

#[async_trait]
impl NodeSession for MockSession {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn connect(&self) -> MqttResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.connect_times.lock().push(Instant::now());

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if self.always_fail_connect.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectFailed("scripted failure".to_string()));
        }
        let remaining = self.fail_connects_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(MqttError::ConnectFailed("scripted failure".to_string()));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("scripted failure".to_string()));
        }
        let qos = effective_qos(topic, qos);
        self.published
            .lock()
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS, handler: MessageHandler) -> MqttResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected);
        }
        self.handlers.lock().insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> MqttResult<()> {
        self.handlers.lock().remove(topic);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> MqttResult<()> {
        self.disconnect().await;
        self.connect().await
    }
}

/// Mock session factory: hands out one `MockSession` per node id and keeps
/// it for inspection across bring-up rounds.
#[derive(Default)]
pub struct MockSessionFactory {
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
    always_fail: Mutex<std::collections::HashSet<String>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect for this node will fail until cleared
    pub fn mark_always_fail(&self, node_id: &str) {
        self.always_fail.lock().insert(node_id.to_string());
    }

    pub fn session(&self, node_id: &str) -> Option<Arc<MockSession>> {
        self.sessions.lock().get(node_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, identity: &NodeIdentity) -> Arc<dyn NodeSession> {
        let session = self
            .sessions
            .lock()
            .entry(identity.node_id.clone())
            .or_insert_with(|| MockSession::new(identity.node_id.clone()))
            .clone();
        if self.always_fail.lock().contains(&identity.node_id) {
            session.set_always_fail_connect(true);
        }
        session
    }
}
