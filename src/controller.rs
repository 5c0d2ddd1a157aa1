//! Controller: owns workflows, tiers, queues, and every thread of a run.
//!
//! Thread inventory: one tier worker per concurrency slot per tier, a CPU
//! pool, an IO pool, a scheduler thread (fixed-interval passes), a straggler
//! monitor, and the calling thread which processes results. All workflow
//! mutation happens under one coarse `SimState` lock; queues, the latency
//! store, and the trace log carry their own internal locks, and no thread
//! ever holds the workflow lock while blocking on a queue.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::SimClock;
use crate::config::{ProviderConfig, SimConfig};
use crate::error::SimError;
use crate::estimates::LatencyEstimateStore;
use crate::latency::{LatencyContext, LatencySampler};
use crate::metrics::{self, SummaryMetrics, TierStats, WorkflowMetrics};
use crate::queue::BlockingQueue;
use crate::rng::SeededRng;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerPolicy, SimState};
use crate::tier::{ProviderManager, QueuedAttempt};
use crate::trace::{TraceEvent, TraceLog};
use crate::types::{node_key, Node, NodeId, ResourceClass, WorkflowId};
use crate::worker::{
    local_worker_loop, tier_worker_loop, AttemptError, AttemptResult, LocalTask, WorkerContext,
};
use crate::workflow::{Workflow, WorkloadParams};

/// Final output of a run.
#[derive(Debug, Clone)]
pub struct SimReport {
    pub workflow_metrics: Vec<WorkflowMetrics>,
    pub tier_stats: Vec<TierStats>,
    pub summary: SummaryMetrics,
}

/// Cadence of the stranded-workflow check in result-loop iterations
/// (~10 ms each).
const STRANDED_CHECK_EVERY: u32 = 100;

struct Shared {
    config: SimConfig,
    provider_config: ProviderConfig,
    providers: Arc<ProviderManager>,
    latency: Arc<LatencyEstimateStore>,
    results: Arc<BlockingQueue<AttemptResult>>,
    cpu_queue: Arc<BlockingQueue<LocalTask>>,
    io_queue: Arc<BlockingQueue<LocalTask>>,
    state: Mutex<SimState>,

    cancel_flags: DashMap<u64, Arc<AtomicBool>>,
    attempt_started: DashMap<u64, Instant>,
    hedged: DashMap<u64, ()>,

    next_attempt_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
    workflows_done: AtomicU32,

    scheduler: Scheduler,
    trace: TraceLog,
    clock: SimClock,
}

pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        Self::with_providers(config, ProviderConfig::default())
    }

    /// Builds a controller against a custom provider universe. Tests use
    /// this to pin tier reliability (e.g. `p_fail = 1.0`).
    pub fn with_providers(
        config: SimConfig,
        provider_config: ProviderConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;

        let providers = Arc::new(ProviderManager::new(&provider_config));
        let latency = Arc::new(LatencyEstimateStore::new());
        let trace = TraceLog::new();
        let clock = SimClock::new(config.time_scale);

        let params = WorkloadParams {
            pdfs: config.pdfs,
            subqueries_per_iter: config.subqueries,
            max_iters: config.iters,
            seed: config.seed,
        };
        let workflows: Vec<Workflow> = (1..=config.workflows)
            .map(|id| Workflow::new(id as WorkflowId, params, &provider_config))
            .collect::<Result<_, _>>()?;

        let cpu_queue = Arc::new(BlockingQueue::new());
        let io_queue = Arc::new(BlockingQueue::new());

        let scheduler_config = SchedulerConfig {
            policy: config.policy,
            enable_model_routing: config.enable_model_routing,
            disable_escalation: config.disable_escalation,
            disable_dag_priority: config.disable_dag_priority,
            max_in_flight_global: config.max_in_flight_global,
            budget_per_workflow: config.budget_per_workflow,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            scheduler_config,
            Arc::clone(&providers),
            Arc::clone(&latency),
            Arc::clone(&cpu_queue),
            Arc::clone(&io_queue),
            trace.clone(),
        );

        Ok(Controller {
            shared: Arc::new(Shared {
                config,
                provider_config,
                providers,
                latency,
                results: Arc::new(BlockingQueue::new()),
                cpu_queue,
                io_queue,
                state: Mutex::new(SimState::new(workflows)),
                cancel_flags: DashMap::new(),
                attempt_started: DashMap::new(),
                hedged: DashMap::new(),
                next_attempt_id: AtomicU64::new(1),
                shutdown: Arc::new(AtomicBool::new(false)),
                workflows_done: AtomicU32::new(0),
                scheduler,
                trace,
                clock,
            }),
        })
    }

    pub fn trace(&self) -> TraceLog {
        self.shared.trace.clone()
    }

    /// Runs the whole simulation to completion and returns the report.
    /// The calling thread acts as the result processor.
    pub fn run(&mut self) -> SimReport {
        let shared = &self.shared;
        let run_start = Instant::now();

        info!(
            workflows = shared.config.workflows,
            policy = %shared.config.policy,
            seed = shared.config.seed,
            "simulation starting"
        );

        // Announce the initial runnable plans.
        {
            let state = shared.state.lock();
            let now = shared.clock.now_ms();
            for wf in state.workflows.values() {
                for nid in wf.runnable_nodes() {
                    shared
                        .trace
                        .emit(TraceEvent::NodeRunnable, now, wf.id(), nid, None);
                }
            }
        }

        let mut handles = Vec::new();

        let sampler = Arc::new(LatencySampler::new(
            shared.provider_config.latency.clone(),
            Arc::new(Mutex::new(SeededRng::new(shared.config.seed))),
        ));
        let ctx = WorkerContext {
            sampler,
            results: Arc::clone(&shared.results),
            latency_store: Arc::clone(&shared.latency),
            trace: shared.trace.clone(),
            clock: shared.clock,
            shutdown: Arc::clone(&shared.shutdown),
            heavy_tail_prob: shared.config.heavy_tail_prob,
            heavy_tail_mult: shared.config.heavy_tail_mult,
        };

        for tier in shared.providers.tiers() {
            for slot in 0..tier.concurrency_cap() {
                let tier = Arc::clone(tier);
                let ctx = ctx.clone();
                handles.push(
                    thread::Builder::new()
                        .name(format!("tier-{}-{}-{}", tier.provider(), tier.tier_id(), slot))
                        .spawn(move || tier_worker_loop(tier, ctx))
                        .expect("spawn tier worker"),
                );
            }
        }
        for slot in 0..shared.config.cpu_workers {
            let queue = Arc::clone(&shared.cpu_queue);
            let ctx = ctx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("cpu-{slot}"))
                    .spawn(move || local_worker_loop(queue, ResourceClass::Cpu, ctx))
                    .expect("spawn cpu worker"),
            );
        }
        for slot in 0..shared.config.io_workers {
            let queue = Arc::clone(&shared.io_queue);
            let ctx = ctx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("io-{slot}"))
                    .spawn(move || local_worker_loop(queue, ResourceClass::Io, ctx))
                    .expect("spawn io worker"),
            );
        }

        {
            let shared = Arc::clone(&self.shared);
            handles.push(
                thread::Builder::new()
                    .name("scheduler".to_string())
                    .spawn(move || shared.scheduler_loop())
                    .expect("spawn scheduler"),
            );
        }
        {
            let shared = Arc::clone(&self.shared);
            handles.push(
                thread::Builder::new()
                    .name("monitor".to_string())
                    .spawn(move || shared.monitor_loop())
                    .expect("spawn monitor"),
            );
        }

        // Result processing until every workflow is done.
        let mut workflow_metrics = Vec::with_capacity(shared.config.workflows as usize);
        let mut loops: u32 = 0;
        while shared.workflows_done.load(Ordering::Acquire) < shared.config.workflows {
            shared.process_available_results(&mut workflow_metrics);
            loops = loops.wrapping_add(1);
            if loops % STRANDED_CHECK_EVERY == 0 {
                shared.reap_stranded_workflows(&mut workflow_metrics);
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }

        // Teardown: stop loops, wake anything parked, join all threads.
        shared.shutdown.store(true, Ordering::Release);
        shared.results.shut_down();
        shared.cpu_queue.shut_down();
        shared.io_queue.shut_down();
        for handle in handles {
            let _ = handle.join();
        }

        let elapsed = run_start.elapsed();
        let tier_stats: Vec<TierStats> = shared
            .providers
            .tiers()
            .iter()
            .map(|t| TierStats {
                provider: Arc::clone(t.provider()),
                tier_id: t.tier_id(),
                utilization: t.utilization(elapsed),
                queue_wait_p95_ms: shared.latency.p95_queue_wait(t.provider(), t.tier_id()),
                in_flight_avg: t.in_flight_avg(),
            })
            .collect();

        let summary = metrics::summarize(&workflow_metrics);
        info!(
            workflows = workflow_metrics.len(),
            makespan_mean_ms = summary.makespan_mean_ms,
            cost_mean = summary.cost_mean,
            "simulation finished"
        );

        SimReport {
            workflow_metrics,
            tier_stats,
            summary,
        }
    }
}

impl Shared {
    fn scheduler_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let now_ms = self.clock.now_ms();
            {
                let mut state = self.state.lock();
                let mut dispatched_wfs: Vec<WorkflowId> = Vec::new();
                self.scheduler.dispatch(
                    &mut state,
                    now_ms,
                    &self.next_attempt_id,
                    &self.cancel_flags,
                    &|node: &Node| node.node_type.is_critical(),
                    &mut |wf_id, nid, _dispatch_ms| {
                        self.attempt_started
                            .insert(node_key(wf_id, nid), Instant::now());
                        dispatched_wfs.push(wf_id);
                    },
                );
                // First dispatch stamps the workflow start time.
                for wf_id in dispatched_wfs {
                    let start = state.start_ms.entry(wf_id).or_insert(-1.0);
                    if *start < 0.0 {
                        *start = now_ms;
                    }
                }
            }
            thread::sleep(self.config.scheduler_interval);
        }
    }

    fn monitor_loop(&self) {
        let hedging_active = self.config.policy == SchedulerPolicy::Full
            && !self.config.disable_hedging;
        while !self.shutdown.load(Ordering::Acquire) {
            for tier in self.providers.tiers() {
                tier.sample_in_flight();
            }
            if hedging_active {
                self.hedge_pass();
            }
            thread::sleep(self.config.monitor_interval);
        }
    }

    /// Scans queued nodes for stragglers and hedges at most one per
    /// workflow per pass on the second-cheapest option.
    fn hedge_pass(&self) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut wf_ids: Vec<WorkflowId> = state.workflows.keys().copied().collect();
        wf_ids.sort_unstable();

        for wf_id in wf_ids {
            let wf = &state.workflows[&wf_id];
            if wf.done() {
                continue;
            }
            let mut candidate: Option<NodeId> = None;
            for node in wf.nodes().values() {
                if node.state != crate::types::NodeState::Queued {
                    continue;
                }
                if !node.node_type.is_critical() || node.preference_list.len() < 2 {
                    continue;
                }
                let key = node_key(wf_id, node.id);
                if self.hedged.contains_key(&key) {
                    continue;
                }
                let Some(started) = self.attempt_started.get(&key) else {
                    continue;
                };
                let runtime_ms = self.clock.scaled_since_ms(*started);
                let preferred = &node.preference_list[0];
                let est_p95 =
                    self.latency
                        .p95(node.node_type, &preferred.provider, preferred.tier_id);
                let stretch = if est_p95 > 0.0 {
                    runtime_ms / est_p95
                } else {
                    0.0
                };
                if stretch > self.config.straggler_stretch_threshold {
                    candidate = Some(node.id);
                    break;
                }
            }
            if let Some(nid) = candidate {
                self.launch_hedge(state, wf_id, nid, now_ms);
            }
        }
    }

    fn launch_hedge(&self, state: &mut SimState, wf_id: WorkflowId, nid: NodeId, now_ms: f64) {
        let node = state.workflows[&wf_id].node(nid);
        let option = node.preference_list[1].clone();
        let Some(tier) = self.providers.get(&option.provider, option.tier_id) else {
            return;
        };
        if !tier.can_accept() {
            return;
        }

        let key = node_key(wf_id, nid);
        // Shared flag: whichever attempt finishes first cancels the other.
        let flag = self
            .cancel_flags
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        let attempt = QueuedAttempt {
            node_id: nid,
            workflow_id: wf_id,
            node_type: node.node_type,
            provider: Arc::clone(tier.provider()),
            tier_id: tier.tier_id(),
            tokens_needed: 1.0,
            timeout_ms: option.timeout_ms,
            max_retries: option.max_retries,
            latency_ctx: LatencyContext {
                node_type: node.node_type,
                pdf_size_est: node.output_size_est,
                num_chunks_est: 50,
                token_length_est: node.output_size_est,
            },
            attempt_id: self.next_attempt_id.fetch_add(1, Ordering::Relaxed),
            cancelled: flag,
            enqueued_at: Instant::now(),
        };

        tier.enqueue(attempt);
        self.hedged.insert(key, ());
        state.counters.entry(wf_id).or_default().hedges_launched += 1;
        self.trace.emit(
            TraceEvent::HedgeLaunched,
            now_ms,
            wf_id,
            nid,
            Some("hedge".to_string()),
        );
        debug!(workflow = wf_id, node = nid, "hedge launched");
    }

    fn process_available_results(&self, workflow_metrics: &mut Vec<WorkflowMetrics>) {
        while let Some(result) = self.results.try_pop() {
            self.apply_result(result, workflow_metrics);
        }
    }

    fn apply_result(&self, result: AttemptResult, workflow_metrics: &mut Vec<WorkflowMetrics>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let now_ms = self.clock.now_ms();
        let key = node_key(result.workflow_id, result.node_id);

        let Some(wf) = state.workflows.get_mut(&result.workflow_id) else {
            return;
        };
        if wf.done() {
            // The workflow finished while this attempt was in flight.
            return;
        }

        let node_state = wf.node(result.node_id).state;
        if node_state.is_terminal() {
            // Late arrival, usually the losing half of a hedge. Keep the
            // books (cancellations, wasted time) but discard the state.
            if result.error == Some(AttemptError::Cancelled) {
                let counters = state.counters.entry(result.workflow_id).or_default();
                counters.cancellations += 1;
                counters.wasted_ms += result.duration_ms;
                self.trace.emit(
                    TraceEvent::AttemptCancel,
                    now_ms,
                    result.workflow_id,
                    result.node_id,
                    Some("hedge_loser".to_string()),
                );
            }
            return;
        }

        let node_type = wf.node(result.node_id).node_type;
        self.latency
            .record(node_type, &result.provider, result.tier_id, result.duration_ms);
        *state.cost.entry(result.workflow_id).or_insert(0.0) += result.cost;

        if result.success {
            // First completion wins: flip the shared flag so a concurrent
            // hedge attempt for this node cancels itself.
            if let Some(flag) = self.cancel_flags.get(&key) {
                flag.store(true, Ordering::Release);
            }
            let newly_runnable = wf.mark_succeeded(result.node_id);
            self.trace.emit(
                TraceEvent::AttemptFinish,
                now_ms,
                result.workflow_id,
                result.node_id,
                Some("ok".to_string()),
            );
            for nid in newly_runnable {
                self.trace
                    .emit(TraceEvent::NodeRunnable, now_ms, result.workflow_id, nid, None);
            }
            self.cancel_flags.remove(&key);
        } else {
            match result.error {
                Some(AttemptError::Cancelled) => {
                    wf.cancel(result.node_id);
                    let counters = state.counters.entry(result.workflow_id).or_default();
                    counters.cancellations += 1;
                    counters.wasted_ms += result.duration_ms;
                    self.trace.emit(
                        TraceEvent::AttemptCancel,
                        now_ms,
                        result.workflow_id,
                        result.node_id,
                        Some("hedge_loser".to_string()),
                    );
                }
                Some(err) => {
                    // Transient failure or timeout: bounded retry, then fail.
                    let node = wf.node_mut(result.node_id);
                    node.attempts_used += 1;
                    let retry = node.attempts_used <= result.max_retries;
                    self.trace.emit(
                        TraceEvent::AttemptFail,
                        now_ms,
                        result.workflow_id,
                        result.node_id,
                        Some(err.as_str().to_string()),
                    );
                    if retry {
                        wf.mark_retry(result.node_id);
                        state.counters.entry(result.workflow_id).or_default().retries += 1;
                        debug!(
                            workflow = result.workflow_id,
                            node = result.node_id,
                            error = err.as_str(),
                            "attempt failed, retrying"
                        );
                    } else {
                        wf.mark_failed(result.node_id);
                        self.cancel_flags.remove(&key);
                    }
                }
                None => unreachable!("unsuccessful result carries an error kind"),
            }
        }

        self.attempt_started.remove(&key);

        if state.workflows[&result.workflow_id].done() {
            self.finish_workflow(state, result.workflow_id, now_ms, workflow_metrics, None);
        }
    }

    /// Books a finished workflow: bumps the done counter, records its
    /// metrics row, and emits `WorkflowDone` (with `extra` marking an
    /// abnormal end). Caller has already set the workflow's `done` flag.
    fn finish_workflow(
        &self,
        state: &SimState,
        wf_id: WorkflowId,
        now_ms: f64,
        workflow_metrics: &mut Vec<WorkflowMetrics>,
        extra: Option<String>,
    ) {
        self.workflows_done.fetch_add(1, Ordering::AcqRel);
        let start_ms = state.start_ms.get(&wf_id).copied().unwrap_or(-1.0);
        let makespan_ms = if start_ms >= 0.0 {
            now_ms - start_ms
        } else {
            now_ms
        };
        let counters = state.counters.get(&wf_id).copied().unwrap_or_default();
        workflow_metrics.push(WorkflowMetrics {
            workflow_id: wf_id,
            makespan_ms,
            cost: state.cost.get(&wf_id).copied().unwrap_or(0.0),
            retries: counters.retries,
            cancellations: counters.cancellations,
            hedges_launched: counters.hedges_launched,
            wasted_ms: counters.wasted_ms,
        });
        self.trace
            .emit(TraceEvent::WorkflowDone, makespan_ms, wf_id, 0, extra);
        info!(workflow = wf_id, makespan_ms, "workflow done");
    }

    /// A not-done workflow with no active nodes can never progress: its
    /// remaining nodes all sit behind a terminal dependency. With a
    /// permanently Failed node that is the expected end of the failure
    /// model (retries exhausted), so the workflow is terminated gracefully
    /// and its metrics recorded. Without one it is an invariant violation
    /// and panics. Budget starvation trips neither: starved nodes stay
    /// Runnable.
    fn reap_stranded_workflows(&self, workflow_metrics: &mut Vec<WorkflowMetrics>) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let now_ms = self.clock.now_ms();

        let stranded: Vec<WorkflowId> = state
            .workflows
            .values()
            .filter(|wf| !wf.done() && wf.active_count() == 0)
            .map(|wf| wf.id())
            .collect();

        for wf_id in stranded {
            let wf = state
                .workflows
                .get_mut(&wf_id)
                .expect("stranded workflow exists");
            let has_failed_node = wf
                .nodes()
                .values()
                .any(|n| n.state == crate::types::NodeState::Failed);
            if !has_failed_node {
                error!(workflow = wf_id, "workflow deadlocked");
                panic!("workflow {wf_id} deadlocked: not done, no active nodes, no failed node");
            }

            warn!(workflow = wf_id, "workflow stranded by permanent failure, terminating");
            wf.abandon();
            self.finish_workflow(
                state,
                wf_id,
                now_ms,
                workflow_metrics,
                Some("failed".to_string()),
            );
        }
    }
}
