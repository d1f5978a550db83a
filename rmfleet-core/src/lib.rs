pub mod app;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod monitor;
pub mod operator;
pub mod ota_store;
mod persist;
pub mod pool;
pub mod response_store;
pub mod session;
pub mod session_store;
pub mod subscription;
pub mod types;

pub use app::{Fleet, FleetStatus};
pub use config::{parse_broker_endpoint, ConfigStore, FleetConfig, DEFAULT_BROKER_PORT};
pub use error::*;
pub use identity::{IdentityStore, NodeIdentity};
pub use logging::{initialize_default_logging, initialize_logging, LogFormat, LogTarget, LoggingConfig};
pub use monitor::{AdaptiveMonitor, MonitorConfig, MonitoringProfile, MonitoringSummary};
pub use operator::{FleetOperator, MessageSink, PublishReport};
pub use ota_store::{OtaJobStore, OtaPartition};
pub use pool::{ConnectionPool, NodeStatusView, PoolConfig, SessionMap};
pub use response_store::{ResponseTraceStore, TraceEntry};
pub use session::{
    effective_qos, MessageHandler, MockSession, MockSessionFactory, MqttSession,
    MqttSessionFactory, NodeSession, SessionConfig, SessionFactory,
};
pub use session_store::{ActiveNode, HistoryEntry, SessionStateStore};
pub use subscription::{SelectiveSubscriptionManager, SubscriptionSummary};
pub use types::*;
