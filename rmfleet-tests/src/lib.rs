//! RM-Fleet scenario tests
//!
//! End-to-end tests for the fleet manager against mock sessions:
//! - fleet bring-up, monitoring seed levels and session-book state
//! - circuit breaker and publish-over-reconnect behavior
//! - connection pacing (rate limit, concurrency cap, batching)
//! - the OTA job lifecycle driven over the wire path
//! - shutdown hygiene under load

pub mod fixtures;
pub mod fleet_tests;
pub mod ota_tests;

pub use fixtures::{node_tree, test_config};
