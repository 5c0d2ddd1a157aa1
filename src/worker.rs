//! Worker loops: dequeue, pay the rate limiter, sleep, report.
//!
//! Tier workers serve provider tiers (token bucket, p_fail, timeout);
//! local workers serve the CPU/IO pools (no bucket, no failures, no cost).
//! A worker never touches workflow state: outcomes travel back to the
//! result processor as `AttemptResult` values.
//!
//! Sleeps are cooperative: broken into ~20 ms chunks with the shared
//! cancellation flag polled between chunks, so a hedge winner can stop the
//! loser within a chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::clock::SimClock;
use crate::estimates::LatencyEstimateStore;
use crate::latency::{LatencyContext, LatencySampler};
use crate::queue::BlockingQueue;
use crate::tier::Tier;
use crate::trace::{TraceEvent, TraceLog};
use crate::types::{AttemptId, NodeId, NodeType, ResourceClass, WorkflowId};

/// How long a worker parks in a dequeue before re-checking shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_millis(100);

/// Granularity of the cooperative cancellation poll.
const CANCEL_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// RESULTS
// ============================================================================

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptError {
    Timeout,
    Failed,
    Cancelled,
}

impl AttemptError {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptError::Timeout => "timeout",
            AttemptError::Failed => "failed",
            AttemptError::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one attempt, produced by a worker.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub attempt_id: AttemptId,
    pub success: bool,
    /// Simulated milliseconds the attempt occupied a worker.
    pub duration_ms: f64,
    pub cost: f64,
    pub provider: Arc<str>,
    pub tier_id: u32,
    pub error: Option<AttemptError>,
    /// Retry budget carried from the execution option.
    pub max_retries: u32,
}

/// A task for the local CPU or IO pool.
pub struct LocalTask {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub node_type: NodeType,
    pub resource_class: ResourceClass,
    pub latency_ctx: LatencyContext,
    pub timeout_ms: u64,
    pub attempt_id: AttemptId,
    pub cancelled: Arc<AtomicBool>,
}

// ============================================================================
// CANCELLABLE SLEEP
// ============================================================================

/// Sleeps `total` in chunks, polling `cancelled` between chunks.
/// Returns true if the flag was observed set.
pub fn cancellable_sleep(total: Duration, cancelled: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancelled.load(Ordering::Acquire) {
            return true;
        }
        let chunk = remaining.min(CANCEL_POLL);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
    cancelled.load(Ordering::Acquire)
}

// ============================================================================
// WORKER CONTEXT
// ============================================================================

/// Shared handles a worker thread needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub sampler: Arc<LatencySampler>,
    pub results: Arc<BlockingQueue<AttemptResult>>,
    pub latency_store: Arc<LatencyEstimateStore>,
    pub trace: TraceLog,
    pub clock: SimClock,
    pub shutdown: Arc<AtomicBool>,
    pub heavy_tail_prob: f64,
    pub heavy_tail_mult: f64,
}

impl WorkerContext {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Run-level heavy-tail injection on top of the per-type tails.
    fn heavy_tail(&self, service_ms: f64) -> f64 {
        if self.heavy_tail_prob > 0.0 && self.sampler.bernoulli(self.heavy_tail_prob) {
            service_ms * self.heavy_tail_mult
        } else {
            service_ms
        }
    }

    /// Real sleep duration for a simulated service time.
    fn scaled_sleep(&self, service_ms: f64) -> Duration {
        let ms = ((service_ms as u64) / self.clock.time_scale() as u64).max(1);
        Duration::from_millis(ms)
    }
}

// ============================================================================
// TIER WORKER
// ============================================================================

/// Loop body for one concurrency slot of a provider tier.
pub fn tier_worker_loop(tier: Arc<Tier>, ctx: WorkerContext) {
    while !ctx.is_shutdown() {
        let Some(attempt) = tier.timed_dequeue(DEQUEUE_WAIT) else {
            continue;
        };

        // Queue wait feeds the escalation estimate for this tier.
        let wait_ms = ctx.clock.scaled_since_ms(attempt.enqueued_at);
        ctx.latency_store
            .record_queue_wait(tier.provider(), tier.tier_id(), wait_ms);

        tier.acquire_tokens(attempt.tokens_needed);

        let start = Instant::now();
        ctx.trace.emit(
            TraceEvent::AttemptStart,
            ctx.clock.now_ms(),
            attempt.workflow_id,
            attempt.node_id,
            Some(format!("{}_{}", tier.provider(), tier.tier_id())),
        );

        let tier_config = tier.config();
        let mut sample = ctx.sampler.sample(
            &attempt.latency_ctx,
            attempt.timeout_ms,
            tier_config.p_fail,
        );
        sample.service_time_ms = ctx.heavy_tail(sample.service_time_ms);

        let cancelled = cancellable_sleep(ctx.scaled_sleep(sample.service_time_ms), &attempt.cancelled);

        let elapsed = start.elapsed();
        let duration_ms = ctx.clock.scaled_since_ms(start);

        let error = if cancelled {
            Some(AttemptError::Cancelled)
        } else if sample.failed {
            Some(AttemptError::Failed)
        } else if sample.timeout {
            Some(AttemptError::Timeout)
        } else {
            None
        };

        trace!(
            workflow = attempt.workflow_id,
            node = attempt.node_id,
            attempt = attempt.attempt_id,
            tier = %tier.provider(),
            outcome = error.map(|e| e.as_str()).unwrap_or("ok"),
            "tier attempt finished"
        );

        tier.note_busy(elapsed);
        tier.on_attempt_finish();
        ctx.results.push(AttemptResult {
            node_id: attempt.node_id,
            workflow_id: attempt.workflow_id,
            attempt_id: attempt.attempt_id,
            success: error.is_none(),
            duration_ms,
            cost: tier_config.price_per_call,
            provider: Arc::clone(tier.provider()),
            tier_id: tier.tier_id(),
            error,
            max_retries: attempt.max_retries,
        });
    }
}

// ============================================================================
// LOCAL WORKER
// ============================================================================

/// Loop body for a CPU or IO pool worker. Local work has no provider, no
/// token bucket, and no transient failures; only cancellation can stop it.
pub fn local_worker_loop(
    queue: Arc<BlockingQueue<LocalTask>>,
    resource_class: ResourceClass,
    ctx: WorkerContext,
) {
    let provider: Arc<str> = Arc::from("local");
    while !ctx.is_shutdown() {
        let Some(task) = queue.timed_pop(DEQUEUE_WAIT) else {
            continue;
        };

        ctx.trace.emit(
            TraceEvent::AttemptStart,
            ctx.clock.now_ms(),
            task.workflow_id,
            task.node_id,
            Some("local".to_string()),
        );

        let mut service_ms = ctx.sampler.sample_service_time(&task.latency_ctx);
        service_ms = ctx.heavy_tail(service_ms);

        let cancelled = cancellable_sleep(ctx.scaled_sleep(service_ms), &task.cancelled);

        trace!(
            workflow = task.workflow_id,
            node = task.node_id,
            attempt = task.attempt_id,
            class = %resource_class,
            cancelled,
            "local task finished"
        );

        ctx.results.push(AttemptResult {
            node_id: task.node_id,
            workflow_id: task.workflow_id,
            attempt_id: task.attempt_id,
            success: !cancelled,
            duration_ms: service_ms,
            cost: 0.0,
            provider: Arc::clone(&provider),
            tier_id: resource_class as u32,
            error: cancelled.then_some(AttemptError::Cancelled),
            max_retries: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LatencyConfig, ProviderConfig, TierConfig};
    use crate::rng::SeededRng;
    use crate::tier::QueuedAttempt;
    use parking_lot::Mutex;
    use std::thread;

    fn test_context(time_scale: u32) -> WorkerContext {
        WorkerContext {
            sampler: Arc::new(LatencySampler::new(
                LatencyConfig::default(),
                Arc::new(Mutex::new(SeededRng::new(1))),
            )),
            results: Arc::new(BlockingQueue::new()),
            latency_store: Arc::new(LatencyEstimateStore::new()),
            trace: TraceLog::new(),
            clock: SimClock::new(time_scale),
            shutdown: Arc::new(AtomicBool::new(false)),
            heavy_tail_prob: 0.0,
            heavy_tail_mult: 1.0,
        }
    }

    #[test]
    fn cancellable_sleep_runs_to_completion() {
        let flag = AtomicBool::new(false);
        let start = Instant::now();
        assert!(!cancellable_sleep(Duration::from_millis(50), &flag));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn cancellable_sleep_stops_early() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::Release);
            })
        };
        let start = Instant::now();
        assert!(cancellable_sleep(Duration::from_secs(5), &flag));
        assert!(start.elapsed() < Duration::from_millis(500));
        setter.join().unwrap();
    }

    #[test]
    fn cancellable_sleep_detects_preset_flag() {
        let flag = AtomicBool::new(true);
        let start = Instant::now();
        assert!(cancellable_sleep(Duration::from_secs(5), &flag));
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn local_worker_produces_successful_result() {
        let ctx = test_context(1_000);
        let queue = Arc::new(BlockingQueue::new());
        queue.push(LocalTask {
            node_id: 4,
            workflow_id: 2,
            node_type: NodeType::Chunk,
            resource_class: ResourceClass::Cpu,
            latency_ctx: LatencyContext::new(NodeType::Chunk),
            timeout_ms: 5_000,
            attempt_id: 10,
            cancelled: Arc::new(AtomicBool::new(false)),
        });

        let handle = {
            let queue = Arc::clone(&queue);
            let ctx = ctx.clone();
            thread::spawn(move || local_worker_loop(queue, ResourceClass::Cpu, ctx))
        };

        let result = ctx
            .results
            .timed_pop(Duration::from_secs(10))
            .expect("local worker should produce a result");
        assert!(result.success);
        assert_eq!(result.node_id, 4);
        assert_eq!(result.workflow_id, 2);
        assert_eq!(result.cost, 0.0);
        assert_eq!(&*result.provider, "local");
        assert_eq!(result.tier_id, ResourceClass::Cpu as u32);
        assert!(result.duration_ms >= 1.0);

        ctx.shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn cancelled_local_task_reports_cancelled() {
        let ctx = test_context(1);
        let queue = Arc::new(BlockingQueue::new());
        let flag = Arc::new(AtomicBool::new(true));
        queue.push(LocalTask {
            node_id: 1,
            workflow_id: 1,
            node_type: NodeType::Chunk,
            resource_class: ResourceClass::Io,
            latency_ctx: LatencyContext {
                pdf_size_est: 100_000, // long enough that cancellation matters
                ..LatencyContext::new(NodeType::Chunk)
            },
            timeout_ms: 5_000,
            attempt_id: 1,
            cancelled: flag,
        });

        let handle = {
            let queue = Arc::clone(&queue);
            let ctx = ctx.clone();
            thread::spawn(move || local_worker_loop(queue, ResourceClass::Io, ctx))
        };

        let result = ctx.results.timed_pop(Duration::from_secs(10)).unwrap();
        assert!(!result.success);
        assert_eq!(result.error, Some(AttemptError::Cancelled));

        ctx.shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn tier_worker_reports_provider_and_cost() {
        let ctx = test_context(1_000);
        let tier = Arc::new(Tier::new(TierConfig {
            p_fail: 0.0,
            ..ProviderConfig::default().tiers[0].clone()
        }));
        tier.enqueue(QueuedAttempt {
            node_id: 9,
            workflow_id: 3,
            node_type: NodeType::Embed,
            provider: Arc::clone(tier.provider()),
            tier_id: tier.tier_id(),
            tokens_needed: 1.0,
            timeout_ms: 10_000,
            max_retries: 3,
            latency_ctx: LatencyContext::new(NodeType::Embed),
            attempt_id: 77,
            cancelled: Arc::new(AtomicBool::new(false)),
            enqueued_at: Instant::now(),
        });

        let handle = {
            let tier = Arc::clone(&tier);
            let ctx = ctx.clone();
            thread::spawn(move || tier_worker_loop(tier, ctx))
        };

        let result = ctx.results.timed_pop(Duration::from_secs(10)).unwrap();
        assert!(result.success);
        assert_eq!(result.attempt_id, 77);
        assert_eq!(&*result.provider, "embed_provider");
        assert_eq!(result.cost, 0.0001);
        assert_eq!(result.max_retries, 3);
        // The attempt released its concurrency slot.
        assert_eq!(tier.in_flight(), 0);
        // An AttemptStart event was traced for it.
        assert!(ctx
            .trace
            .snapshot()
            .iter()
            .any(|r| r.ev == TraceEvent::AttemptStart && r.node == 9));

        ctx.shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
