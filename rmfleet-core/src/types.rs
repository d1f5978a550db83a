use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lifecycle state of a node's broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    CircuitOpen,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Per-node connection counters kept by the pool.
///
/// All counters are monotonic except `consecutive_failures` (reset on
/// success) and `connect_start` (reset on each reconnect).
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub connect_start: Option<Instant>,
}

impl ConnectionStats {
    /// Uptime of the current connection, `None` while not connected.
    pub fn uptime(&self) -> Option<Duration> {
        self.connect_start.map(|start| start.elapsed())
    }
}

/// Monitoring tier assigned to a node. Variant order is priority order:
/// sorting ascending puts the sickest tier first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringLevel {
    Critical,
    High,
    Normal,
    Low,
    Minimal,
}

impl MonitoringLevel {
    /// Default check interval, chosen relative to the broker's 20 s
    /// keep-alive period.
    pub fn default_interval(&self) -> Duration {
        match self {
            MonitoringLevel::Critical => Duration::from_secs(15),
            MonitoringLevel::High => Duration::from_secs(25),
            MonitoringLevel::Normal => Duration::from_secs(45),
            MonitoringLevel::Low => Duration::from_secs(120),
            MonitoringLevel::Minimal => Duration::from_secs(300),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringLevel::Critical => "critical",
            MonitoringLevel::High => "high",
            MonitoringLevel::Normal => "normal",
            MonitoringLevel::Low => "low",
            MonitoringLevel::Minimal => "minimal",
        }
    }
}

impl std::fmt::Display for MonitoringLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status values carried on the `otastatus` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OtaStatus {
    InProgress,
    Success,
    Rejected,
    Failed,
    Delayed,
}

impl OtaStatus {
    /// A terminal status moves the job from the Active partition to History.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OtaStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::InProgress => "in-progress",
            OtaStatus::Success => "success",
            OtaStatus::Rejected => "rejected",
            OtaStatus::Failed => "failed",
            OtaStatus::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OtaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(OtaStatus::InProgress),
            "success" => Ok(OtaStatus::Success),
            "rejected" => Ok(OtaStatus::Rejected),
            "failed" => Ok(OtaStatus::Failed),
            "delayed" => Ok(OtaStatus::Delayed),
            other => Err(format!("unknown OTA status: {other}")),
        }
    }
}

/// User role in a TLV command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum UserRole {
    Admin,
    Primary,
    Secondary,
}

impl From<UserRole> for u8 {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::Admin => 1,
            UserRole::Primary => 2,
            UserRole::Secondary => 4,
        }
    }
}

impl TryFrom<u8> for UserRole {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(UserRole::Admin),
            2 => Ok(UserRole::Primary),
            4 => Ok(UserRole::Secondary),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

/// Command frame exchanged on the `from-node`/`to-node` topics.
///
/// The wire format is a JSON mapping with numeric-string keys:
/// "1" = request id, "2" = role, "5" = command code, "6" = optional data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(rename = "1")]
    pub request_id: String,
    #[serde(rename = "2")]
    pub role: UserRole,
    #[serde(rename = "5")]
    pub command: u32,
    #[serde(rename = "6", skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandFrame {
    pub fn new(request_id: impl Into<String>, role: UserRole, command: u32) -> Self {
        Self {
            request_id: request_id.into(),
            role,
            command,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Configuration for logging levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Trace => write!(f, "TRACE"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitoring_level_priority_order() {
        let mut levels = vec![
            MonitoringLevel::Minimal,
            MonitoringLevel::Critical,
            MonitoringLevel::Low,
            MonitoringLevel::High,
            MonitoringLevel::Normal,
        ];
        levels.sort();
        assert_eq!(
            levels,
            vec![
                MonitoringLevel::Critical,
                MonitoringLevel::High,
                MonitoringLevel::Normal,
                MonitoringLevel::Low,
                MonitoringLevel::Minimal,
            ]
        );
    }

    #[test]
    fn test_ota_status_terminality() {
        assert!(!OtaStatus::InProgress.is_terminal());
        assert!(OtaStatus::Success.is_terminal());
        assert!(OtaStatus::Rejected.is_terminal());
        assert!(OtaStatus::Failed.is_terminal());
        assert!(OtaStatus::Delayed.is_terminal());
    }

    #[test]
    fn test_ota_status_round_trip() {
        for status in [
            OtaStatus::InProgress,
            OtaStatus::Success,
            OtaStatus::Rejected,
            OtaStatus::Failed,
            OtaStatus::Delayed,
        ] {
            let parsed: OtaStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("finished".parse::<OtaStatus>().is_err());
    }

    #[test]
    fn test_command_frame_wire_format() {
        let frame = CommandFrame::new("req-7", UserRole::Admin, 3)
            .with_data(serde_json::json!({"Light": {"output": true}}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["1"], "req-7");
        assert_eq!(value["2"], 1);
        assert_eq!(value["5"], 3);
        assert_eq!(value["6"]["Light"]["output"], true);

        let bare = CommandFrame::new("req-8", UserRole::Secondary, 0);
        let value = serde_json::to_value(&bare).unwrap();
        assert_eq!(value["2"], 4);
        assert!(value.get("6").is_none());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(SessionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_connection_stats_uptime() {
        let mut stats = ConnectionStats::default();
        assert!(stats.uptime().is_none());
        stats.connect_start = Some(Instant::now());
        assert!(stats.uptime().is_some());
    }
}
