//! 🩺 Availability tracking: is this node alive? Is this cluster alive? Are any of us?
//!
//! 🧠 Knowledge graph:
//! - `NodeAvailable` and `ClusterMetadata` each run the same little vote machine. Failures
//!   cast votes (rate-limited per key), enough votes plus enough silence flips the entity to
//!   Unavailable, and a single success (also rate-limited) flips it back.
//! - `KeyedRateLimiter` is the shared ballot box. One token bucket per (purpose, key), so a
//!   storm of failures in one second counts as one vote, not ten thousand.
//! - `ClusterRegistry` owns every `ClusterMetadata`. It is injected, never global.
//!
//! ⚠️ Healthy-path reads are atomics. Locks only come out when state actually changes. A
//! cluster doing 50k bulk requests a second should not be queueing on a mutex to say "still fine".
//!
//! 🦆 The duck is Available. The duck has always been Available. Do not ask the duck about 2019.

mod cluster;
mod node;
mod rate_limiter;
mod registry;

use std::time::Duration;

use serde::Deserialize;

pub use cluster::{BasicAuth, ClusterConfig, ClusterMetadata};
pub use node::NodeAvailable;
pub use rate_limiter::KeyedRateLimiter;
pub use registry::ClusterRegistry;

/// 🏷️ Rate limiter purposes. One bucket per (purpose, key).
pub(crate) const NODE_FAILURE: &str = "node_failure";
pub(crate) const NODE_AVAILABLE: &str = "node_available";
pub(crate) const CLUSTER_FAILURE: &str = "cluster_failure";
pub(crate) const CLUSTER_AVAILABLE: &str = "cluster_available";
pub(crate) const NO_HOST_LOG: &str = "no_host_log";

const MASTER_NOT_DISCOVERED: &str = "master_not_discovered_exception";

/// 👑 Does this error text say the cluster lost its master?
pub fn is_master_not_discovered(error: &str) -> bool {
    error.contains(MASTER_NOT_DISCOVERED)
}

fn default_failure_ticket_threshold() -> u32 {
    10
}

fn default_short_threshold_in_seconds() -> u64 {
    5
}

fn default_long_threshold_in_seconds() -> u64 {
    10
}

fn default_dead_after_in_seconds() -> u64 {
    // ⚰️ one hour of silence and we stop pretending
    60 * 60
}

fn default_vote_window_in_millis() -> u64 {
    1000
}

/// 🗳️ Voting thresholds for one kind of entity (node or cluster).
///
/// An entity flips to Unavailable when `ticket >= failure_ticket_threshold` and at least
/// `short_threshold` has passed since the last success, or when at least `long_threshold`
/// has passed no matter how few votes came in.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AvailabilityPolicy {
    #[serde(default = "default_failure_ticket_threshold")]
    pub failure_ticket_threshold: u32,
    #[serde(default = "default_short_threshold_in_seconds")]
    pub short_threshold_in_seconds: u64,
    #[serde(default = "default_long_threshold_in_seconds")]
    pub long_threshold_in_seconds: u64,
    #[serde(default = "default_dead_after_in_seconds")]
    pub dead_after_in_seconds: u64,
    /// 🪣 One vote per key per window.
    #[serde(default = "default_vote_window_in_millis")]
    pub vote_window_in_millis: u64,
}

impl Default for AvailabilityPolicy {
    fn default() -> Self {
        Self {
            failure_ticket_threshold: default_failure_ticket_threshold(),
            short_threshold_in_seconds: default_short_threshold_in_seconds(),
            long_threshold_in_seconds: default_long_threshold_in_seconds(),
            dead_after_in_seconds: default_dead_after_in_seconds(),
            vote_window_in_millis: default_vote_window_in_millis(),
        }
    }
}

impl AvailabilityPolicy {
    pub fn short_threshold(&self) -> Duration {
        Duration::from_secs(self.short_threshold_in_seconds)
    }

    pub fn long_threshold(&self) -> Duration {
        Duration::from_secs(self.long_threshold_in_seconds)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_secs(self.dead_after_in_seconds)
    }

    pub fn vote_window(&self) -> Duration {
        Duration::from_millis(self.vote_window_in_millis)
    }

    /// ⚖️ The flip condition, in one place so nodes and clusters can't drift apart.
    pub(crate) fn should_flip(&self, ticket: u32, since_success: Duration) -> bool {
        (ticket >= self.failure_ticket_threshold && since_success >= self.short_threshold())
            || since_success >= self.long_threshold()
    }
}

/// 🔧 `[availability]` config block: separate policies for nodes and clusters.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub node: AvailabilityPolicy,
    #[serde(default)]
    pub cluster: AvailabilityPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_both_thresholds_must_agree() {
        let policy = AvailabilityPolicy::default();
        // -- plenty of votes, not enough silence
        assert!(!policy.should_flip(50, Duration::from_secs(1)));
        // -- plenty of silence, not enough votes
        assert!(!policy.should_flip(3, Duration::from_secs(6)));
        // -- both
        assert!(policy.should_flip(10, Duration::from_secs(6)));
        // -- so much silence that votes stop mattering
        assert!(policy.should_flip(1, Duration::from_secs(11)));
    }

    #[test]
    fn the_one_where_master_loss_is_recognized() {
        assert!(is_master_not_discovered(
            r#"{"error":{"type":"master_not_discovered_exception"}}"#
        ));
        assert!(!is_master_not_discovered("connection refused"));
    }
}
