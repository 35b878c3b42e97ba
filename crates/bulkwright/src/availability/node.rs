use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AvailabilityPolicy, KeyedRateLimiter, NODE_AVAILABLE, NODE_FAILURE};

/// 🖥️ Health of one Elasticsearch node (one `host:port`).
///
/// Flags and timestamps are atomics, so "did the last request work?" never takes a lock.
/// The ticket counter lives behind a mutex because flipping state is a read-modify-write.
#[derive(Debug)]
pub struct NodeAvailable {
    cluster_id: String,
    host: String,
    limiter_key: String,
    policy: AvailabilityPolicy,
    limiter: Arc<KeyedRateLimiter>,
    epoch: Instant,
    available: AtomicBool,
    dead: AtomicBool,
    last_success_ms: AtomicU64,
    last_check_ms: AtomicU64,
    ticket: Mutex<u32>,
}

impl NodeAvailable {
    pub fn new(
        cluster_id: &str,
        host: &str,
        policy: AvailabilityPolicy,
        limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        Self::new_at(Instant::now(), cluster_id, host, policy, limiter)
    }

    /// ⏱️ Born at `now`, which also counts as its first success.
    pub fn new_at(
        now: Instant,
        cluster_id: &str,
        host: &str,
        policy: AvailabilityPolicy,
        limiter: Arc<KeyedRateLimiter>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_owned(),
            host: host.to_owned(),
            limiter_key: format!("{cluster_id}/{host}"),
            policy,
            limiter,
            epoch: now,
            available: AtomicBool::new(true),
            dead: AtomicBool::new(false),
            last_success_ms: AtomicU64::new(0),
            last_check_ms: AtomicU64::new(0),
            ticket: Mutex::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// 🔑 `cluster_id/host`. The same host can sit in two clusters; their votes stay apart.
    pub fn limiter_key(&self) -> &str {
        &self.limiter_key
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn failure_tickets(&self) -> u32 {
        *self.ticket.lock()
    }

    pub fn last_success(&self) -> Instant {
        self.instant_of(self.last_success_ms.load(Ordering::Acquire))
    }

    pub fn last_check(&self) -> Instant {
        self.instant_of(self.last_check_ms.load(Ordering::Acquire))
    }

    pub fn report_failure(&self) {
        self.report_failure_at(Instant::now());
    }

    /// 👎 One failure vote, if the ballot box is open.
    pub fn report_failure_at(&self, now: Instant) {
        self.last_check_ms.store(self.millis_of(now), Ordering::Release);
        let since_success = now.saturating_duration_since(self.last_success());

        let mut ticket = self.ticket.lock();
        if !self.is_available() {
            if !self.is_dead() && since_success > self.policy.dead_after() {
                self.dead.store(true, Ordering::Release);
                warn!(
                    "⚰️ node [{}] of [{}] has been unavailable for {:?}, marking it dead",
                    self.host, self.cluster_id, since_success
                );
            }
            return;
        }
        if self.host.is_empty() {
            return;
        }

        let window = self.policy.vote_window();
        if !self
            .limiter
            .allow_at(now, NODE_FAILURE, &self.limiter_key, 1, 1, window)
        {
            return;
        }

        *ticket += 1;
        debug!(
            "👎 node [{}] of [{}] failure ticket {}, {:?} since last success",
            self.host, self.cluster_id, *ticket, since_success
        );
        if self.policy.should_flip(*ticket, since_success) {
            self.available.store(false, Ordering::Release);
            *ticket = 0;
            info!(
                "🔌 node [{}] of [{}] is not available",
                self.host, self.cluster_id
            );
        }
    }

    pub fn report_success(&self) {
        self.report_success_at(Instant::now());
    }

    /// 👍 Record a success. Flips back to Available if the limiter lets us.
    pub fn report_success_at(&self, now: Instant) {
        let stamp = self.millis_of(now);
        self.last_success_ms.store(stamp, Ordering::Release);
        self.last_check_ms.store(stamp, Ordering::Release);
        if self.is_available() {
            return;
        }

        let mut ticket = self.ticket.lock();
        if self.is_available() {
            return;
        }
        let window = self.policy.vote_window();
        if self
            .limiter
            .allow_at(now, NODE_AVAILABLE, &self.limiter_key, 1, 1, window)
        {
            self.available.store(true, Ordering::Release);
            self.dead.store(false, Ordering::Release);
            *ticket = 0;
            info!(
                "✅ node [{}] of [{}] is available again",
                self.host, self.cluster_id
            );
        }
    }

    fn millis_of(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn instant_of(&self, millis: u64) -> Instant {
        self.epoch + Duration::from_millis(millis)
    }
}
