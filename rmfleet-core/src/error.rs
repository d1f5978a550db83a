use thiserror::Error;

/// Top-level error type covering every subsystem of the fleet manager
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("OTA error: {0}")]
    Ota(#[from] OtaError),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Certificate discovery errors. Fatal for the affected node only, except
/// `NoNodes` which aborts startup.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Root CA certificate not found for node {0}")]
    RootCaMissing(String),

    #[error("Certificate file not found: {0}")]
    CertMissing(String),

    #[error("No nodes discovered under {0}")]
    NoNodes(String),
}

/// Per-session MQTT errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// State-file persistence errors. Logged by the owning store; never abort
/// an operation (readers fall back to the in-memory value).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// OTA job registry errors
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("OTA URL response for node {0} has no ota_job_id")]
    MissingJobId(String),
}

/// Result type alias for fleet-level operations
pub type FleetResult<T> = Result<T, FleetError>;

/// Result type alias for identity discovery
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Result type alias for MQTT session operations
pub type MqttResult<T> = Result<T, MqttError>;

/// Result type alias for state-file persistence
pub type StoreResult<T> = Result<T, StoreError>;
