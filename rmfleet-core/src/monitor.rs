use crate::{pool::SessionMap, MonitoringLevel};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Topics every monitored node listens on by default
pub const DEFAULT_MONITOR_TOPICS: [&str; 3] = ["params/remote", "otaurl", "to-node"];

/// Idle time after which a node is promoted to at least High
const INACTIVITY_PROMOTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Cap on simultaneously running monitor tasks, 0 = unlimited.
    /// Excess nodes queue and start when a slot frees.
    pub max_concurrent_monitors: usize,
    /// How many bring-up survivors are seeded at High so fleet-wide
    /// problems surface at a faster cadence
    pub high_priority_seed: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_monitors: 0,
            high_priority_seed: 2,
        }
    }
}

/// Monitoring profile for a node
#[derive(Debug, Clone)]
pub struct MonitoringProfile {
    pub node_id: String,
    pub level: MonitoringLevel,
    pub last_activity: Instant,
    pub error_count: u32,
    pub consecutive_successes: u32,
    pub topics_of_interest: BTreeSet<String>,
    pub custom_interval: Option<Duration>,
}

impl MonitoringProfile {
    fn new(node_id: String, level: MonitoringLevel, topics: BTreeSet<String>) -> Self {
        Self {
            node_id,
            level,
            last_activity: Instant::now(),
            error_count: 0,
            consecutive_successes: 0,
            topics_of_interest: topics,
            custom_interval: None,
        }
    }

    /// Check interval: the level's default unless a custom interval is set
    pub fn interval(&self) -> Duration {
        self.custom_interval
            .unwrap_or_else(|| self.level.default_interval())
    }
}

/// Aggregate view of the monitor for the operator's status display
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSummary {
    pub total_nodes: usize,
    pub active_monitors: usize,
    pub level_distribution: BTreeMap<String, usize>,
    pub nodes_with_errors: usize,
}

/// Fold one health check into a profile. `idle` is how long the node has
/// gone without recorded activity.
fn record_check(profile: &mut MonitoringProfile, healthy: bool, idle: Duration) {
    if healthy {
        profile.consecutive_successes += 1;
    } else {
        profile.error_count += 1;
        profile.consecutive_successes = 0;
    }

    if idle > INACTIVITY_PROMOTION && profile.level > MonitoringLevel::High {
        profile.level = MonitoringLevel::High;
    }
}

/// Dynamic level adjustment after a check
fn adjust_level(profile: &mut MonitoringProfile) {
    if profile.error_count > 0 && profile.consecutive_successes < 3 {
        profile.level = MonitoringLevel::High;
    }
    if profile.consecutive_successes >= 10 {
        if profile.level == MonitoringLevel::High {
            profile.level = MonitoringLevel::Normal;
        } else if profile.level == MonitoringLevel::Normal && profile.error_count == 0 {
            profile.level = MonitoringLevel::Low;
        }
    }
    if profile.consecutive_successes >= 20 {
        profile.error_count = profile.error_count.saturating_sub(1);
    }
}

/// Adaptive monitoring system: one periodic task per node, with the check
/// cadence driven by the node's current level.
pub struct AdaptiveMonitor {
    config: MonitorConfig,
    sessions: SessionMap,
    profiles: Arc<RwLock<HashMap<String, MonitoringProfile>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    monitor_slots: Option<Arc<Semaphore>>,
    shutdown: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
}

impl AdaptiveMonitor {
    pub fn new(config: MonitorConfig, sessions: SessionMap, shutdown: watch::Receiver<bool>) -> Self {
        let monitor_slots = (config.max_concurrent_monitors > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_monitors)));
        Self {
            config,
            sessions,
            profiles: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            monitor_slots,
            shutdown,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Add a node and start its monitor task. With a bounded slot budget
    /// the task waits its turn before the first check.
    pub fn add_node(
        &self,
        node_id: &str,
        initial_level: MonitoringLevel,
        topics: Option<BTreeSet<String>>,
    ) {
        let topics = topics.unwrap_or_else(|| {
            DEFAULT_MONITOR_TOPICS.iter().map(|t| t.to_string()).collect()
        });
        self.profiles.write().insert(
            node_id.to_string(),
            MonitoringProfile::new(node_id.to_string(), initial_level, topics),
        );

        let task_key = node_id.to_string();
        let node_id = node_id.to_string();
        let profiles = Arc::clone(&self.profiles);
        let sessions = Arc::clone(&self.sessions);
        let slots = self.monitor_slots.clone();
        let running = Arc::clone(&self.running);
        let mut shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let _permit = match slots {
                Some(slots) => match slots.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            loop {
                if !running.load(Ordering::SeqCst) || *shutdown.borrow() {
                    break;
                }

                let session = sessions.read().get(&node_id).cloned();
                let healthy = match session {
                    Some(session) => session.is_connected().await,
                    None => false,
                };

                let interval = {
                    let mut profiles = profiles.write();
                    let Some(profile) = profiles.get_mut(&node_id) else {
                        break;
                    };
                    if !healthy {
                        debug!("Health check failed for {node_id}");
                    }
                    let idle = profile.last_activity.elapsed();
                    record_check(profile, healthy, idle);
                    adjust_level(profile);
                    profile.interval()
                };

                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        });

        if let Some(old) = self.tasks.lock().insert(task_key, task) {
            old.abort();
        }
    }

    pub fn remove_node(&self, node_id: &str) {
        if let Some(task) = self.tasks.lock().remove(node_id) {
            task.abort();
        }
        self.profiles.write().remove(node_id);
    }

    pub fn update_node_level(&self, node_id: &str, level: MonitoringLevel) {
        if let Some(profile) = self.profiles.write().get_mut(node_id) {
            profile.level = level;
            debug!("Updated monitoring level for {node_id} to {level}");
        }
    }

    /// Record inbound traffic or a completed operation for a node
    pub fn record_node_activity(&self, node_id: &str, successful_operation: bool) {
        if let Some(profile) = self.profiles.write().get_mut(node_id) {
            profile.last_activity = Instant::now();
            if successful_operation {
                profile.consecutive_successes += 1;
            }
        }
    }

    /// External error signal: forces Critical and resets the success streak
    pub fn record_node_error(&self, node_id: &str) {
        if let Some(profile) = self.profiles.write().get_mut(node_id) {
            profile.error_count += 1;
            profile.consecutive_successes = 0;
            profile.level = MonitoringLevel::Critical;
            warn!("Error recorded for {node_id}");
        }
    }

    pub fn profile(&self, node_id: &str) -> Option<MonitoringProfile> {
        self.profiles.read().get(node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.profiles.read().len()
    }

    /// Nodes ordered sickest-first: by level tier, then descending error
    /// count, then least-recent activity. The basis for subscription
    /// allocation when slots are scarce.
    pub fn get_priority_nodes(&self, max_count: Option<usize>) -> Vec<String> {
        let profiles = self.profiles.read();
        let mut nodes: Vec<(MonitoringLevel, Reverse<u32>, Instant, String)> = profiles
            .values()
            .map(|p| (p.level, Reverse(p.error_count), p.last_activity, p.node_id.clone()))
            .collect();
        nodes.sort();

        let ordered: Vec<String> = nodes.into_iter().map(|(_, _, _, id)| id).collect();
        match max_count {
            Some(max) => ordered.into_iter().take(max).collect(),
            None => ordered,
        }
    }

    pub fn summary(&self) -> MonitoringSummary {
        let profiles = self.profiles.read();
        let mut level_distribution: BTreeMap<String, usize> = BTreeMap::new();
        let mut nodes_with_errors = 0;
        for profile in profiles.values() {
            *level_distribution
                .entry(profile.level.as_str().to_string())
                .or_default() += 1;
            if profile.error_count > 0 {
                nodes_with_errors += 1;
            }
        }
        MonitoringSummary {
            total_nodes: profiles.len(),
            active_monitors: self.tasks.lock().len(),
            level_distribution,
            nodes_with_errors,
        }
    }

    /// Stop all monitor tasks. Bounded: tasks are aborted outright.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}
