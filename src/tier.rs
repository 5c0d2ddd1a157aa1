//! Provider tiers: token bucket, FIFO attempt queue, concurrency cap.
//!
//! A tier accepts attempts into an unbounded FIFO; workers dequeue only
//! while `in_flight < concurrency_cap`, then pay the token bucket before
//! sampling service time. Busy-time and in-flight sampling counters feed
//! the per-tier utilization columns of tiers.csv.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{ProviderConfig, TierConfig};
use crate::latency::LatencyContext;
use crate::types::{AttemptId, NodeId, NodeType, WorkflowId};

// ============================================================================
// TOKEN BUCKET
// ============================================================================

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket: refill `rate_per_sec`, bounded by `capacity`.
/// `acquire` blocks until enough tokens accumulate.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
    cv: Condvar,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        assert!(
            rate_per_sec > 0.0 && capacity > 0.0,
            "token bucket rate and capacity must be positive"
        );
        TokenBucket {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            cv: Condvar::new(),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    pub fn acquire(&self, tokens: f64) {
        if tokens <= 0.0 {
            return;
        }
        let mut state = self.state.lock();
        loop {
            self.refill(&mut state);
            if state.tokens >= tokens {
                state.tokens -= tokens;
                return;
            }
            let wait = Duration::from_secs_f64((tokens - state.tokens) / self.rate_per_sec);
            self.cv.wait_for(&mut state, wait);
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

// ============================================================================
// QUEUED ATTEMPT
// ============================================================================

/// One unit of work enqueued to a tier.
pub struct QueuedAttempt {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub node_type: NodeType,
    pub provider: Arc<str>,
    pub tier_id: u32,
    pub tokens_needed: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub latency_ctx: LatencyContext,
    pub attempt_id: AttemptId,
    pub cancelled: Arc<std::sync::atomic::AtomicBool>,
    pub enqueued_at: Instant,
}

// ============================================================================
// TIER
// ============================================================================

/// A single provider tier shared between the scheduler and its workers.
pub struct Tier {
    config: TierConfig,
    bucket: TokenBucket,
    queue: Mutex<VecDeque<QueuedAttempt>>,
    queue_cv: Condvar,
    in_flight: AtomicU32,

    // Accounting for tiers.csv.
    busy_micros: AtomicU64,
    in_flight_sample_sum: AtomicU64,
    in_flight_sample_count: AtomicU64,
}

impl Tier {
    pub fn new(config: TierConfig) -> Self {
        let bucket = TokenBucket::new(config.rate_per_sec, config.capacity);
        Tier {
            config,
            bucket,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            in_flight: AtomicU32::new(0),
            busy_micros: AtomicU64::new(0),
            in_flight_sample_sum: AtomicU64::new(0),
            in_flight_sample_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<str> {
        &self.config.provider
    }

    pub fn tier_id(&self) -> u32 {
        self.config.tier_id
    }

    pub fn concurrency_cap(&self) -> u32 {
        self.config.concurrency_cap
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn can_accept(&self) -> bool {
        self.in_flight() < self.config.concurrency_cap
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn enqueue(&self, attempt: QueuedAttempt) {
        {
            let mut q = self.queue.lock();
            q.push_back(attempt);
        }
        self.queue_cv.notify_one();
    }

    /// Pops the next attempt once one is queued and a concurrency slot is
    /// free, or returns `None` after `timeout`. Increments `in_flight` on
    /// success; the caller must pair it with `on_attempt_finish`.
    pub fn timed_dequeue(&self, timeout: Duration) -> Option<QueuedAttempt> {
        let deadline = Instant::now() + timeout;
        let mut q = self.queue.lock();
        loop {
            if !q.is_empty() && self.can_accept() {
                let attempt = q.pop_front().expect("queue checked non-empty");
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return Some(attempt);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.queue_cv.wait_for(&mut q, deadline - now);
        }
    }

    pub fn acquire_tokens(&self, tokens: f64) {
        self.bucket.acquire(tokens);
    }

    pub fn on_attempt_finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.queue_cv.notify_one();
    }

    /// Adds attempt wall time to the busy counter (utilization numerator).
    pub fn note_busy(&self, elapsed: Duration) {
        self.busy_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Records one in-flight observation; the monitor loop calls this on a
    /// fixed cadence so the mean is time-weighted.
    pub fn sample_in_flight(&self) {
        self.in_flight_sample_sum
            .fetch_add(self.in_flight() as u64, Ordering::Relaxed);
        self.in_flight_sample_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of capacity-time spent on attempts over `elapsed`.
    pub fn utilization(&self, elapsed: Duration) -> f64 {
        let denom = elapsed.as_secs_f64() * self.config.concurrency_cap as f64;
        if denom <= 0.0 {
            return 0.0;
        }
        let busy = self.busy_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        (busy / denom).min(1.0)
    }

    pub fn in_flight_avg(&self) -> f64 {
        let count = self.in_flight_sample_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.in_flight_sample_sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn token_bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}

// ============================================================================
// PROVIDER MANAGER
// ============================================================================

/// Owns all configured tiers.
pub struct ProviderManager {
    tiers: Vec<Arc<Tier>>,
}

impl ProviderManager {
    pub fn new(config: &ProviderConfig) -> Self {
        ProviderManager {
            tiers: config
                .tiers
                .iter()
                .cloned()
                .map(|tc| Arc::new(Tier::new(tc)))
                .collect(),
        }
    }

    pub fn get(&self, provider: &str, tier_id: u32) -> Option<&Arc<Tier>> {
        self.tiers
            .iter()
            .find(|t| &**t.provider() == provider && t.tier_id() == tier_id)
    }

    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }
}
