//! Resource-aware dispatch of runnable nodes onto tiers and local pools.
//!
//! A pass scores every runnable node (remaining critical path, slack, age),
//! walks nodes in score order, picks an execution option under the
//! per-workflow budget (with one optional escalation step for critical
//! nodes), and enqueues attempts until the global in-flight cap is reached.
//!
//! The caller holds the workflow-set lock for the whole pass; the scheduler
//! itself only takes tier and estimate-store locks, never both at once with
//! the workflow lock on the other side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::estimates::LatencyEstimateStore;
use crate::queue::BlockingQueue;
use crate::tier::{ProviderManager, QueuedAttempt, Tier};
use crate::trace::{TraceEvent, TraceLog};
use crate::types::{node_key, ExecutionOption, Node, NodeId, ResourceClass, WorkflowId};
use crate::worker::LocalTask;
use crate::workflow::Workflow;

/// Estimate used for a (type, tier) pair with no recorded samples yet.
const DEFAULT_ESTIMATE_MS: f64 = 100.0;

// ============================================================================
// POLICY AND CONFIG
// ============================================================================

/// Scheduling policy variants compared by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulerPolicy {
    /// Age-ordered dispatch to the cheapest tier.
    #[value(name = "fifo_cheapest")]
    FifoCheapest,
    /// DAG-aware scoring, cheapest tier.
    #[value(name = "dag_cheapest")]
    DagCheapest,
    /// DAG-aware scoring with benefit/cost escalation.
    #[value(name = "dag_escalation")]
    DagEscalation,
    /// Scoring, escalation, and straggler hedging.
    #[value(name = "full")]
    Full,
}

impl SchedulerPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerPolicy::FifoCheapest => "fifo_cheapest",
            SchedulerPolicy::DagCheapest => "dag_cheapest",
            SchedulerPolicy::DagEscalation => "dag_escalation",
            SchedulerPolicy::Full => "full",
        }
    }

    fn scores_by_age_only(self) -> bool {
        self == SchedulerPolicy::FifoCheapest
    }

    fn always_cheapest(self) -> bool {
        matches!(
            self,
            SchedulerPolicy::FifoCheapest | SchedulerPolicy::DagCheapest
        )
    }
}

impl std::fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: SchedulerPolicy,
    pub enable_model_routing: bool,
    pub disable_escalation: bool,
    pub disable_dag_priority: bool,
    pub max_in_flight_global: usize,
    pub budget_per_workflow: f64,
    pub escalation_benefit_cost_threshold: f64,
    /// Score weights: remaining critical path, slack, age.
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            policy: SchedulerPolicy::Full,
            enable_model_routing: false,
            disable_escalation: false,
            disable_dag_priority: false,
            max_in_flight_global: 200,
            budget_per_workflow: 10.0,
            escalation_benefit_cost_threshold: 0.5,
            alpha: 1.0,
            beta: 0.5,
            gamma: 0.1,
        }
    }
}

// ============================================================================
// SIM STATE
// ============================================================================

/// Per-workflow counters reported in workflows.csv.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowCounters {
    pub retries: u32,
    pub cancellations: u32,
    pub hedges_launched: u32,
    pub wasted_ms: f64,
}

/// The mutable simulation state guarded by the workflow-set lock.
pub struct SimState {
    pub workflows: FxHashMap<WorkflowId, Workflow>,
    /// Simulated timestamp of each workflow's first dispatch; -1 before it.
    pub start_ms: FxHashMap<WorkflowId, f64>,
    pub cost: FxHashMap<WorkflowId, f64>,
    pub counters: FxHashMap<WorkflowId, WorkflowCounters>,
}

impl SimState {
    pub fn new(workflows: impl IntoIterator<Item = Workflow>) -> Self {
        let workflows: FxHashMap<WorkflowId, Workflow> =
            workflows.into_iter().map(|wf| (wf.id(), wf)).collect();
        let start_ms = workflows.keys().map(|id| (*id, -1.0)).collect();
        let cost = workflows.keys().map(|id| (*id, 0.0)).collect();
        let counters = workflows
            .keys()
            .map(|id| (*id, WorkflowCounters::default()))
            .collect();
        SimState {
            workflows,
            start_ms,
            cost,
            counters,
        }
    }

    /// Nodes with a dispatched or running attempt across not-done workflows.
    pub fn global_in_flight(&self) -> usize {
        self.workflows
            .values()
            .filter(|wf| !wf.done())
            .flat_map(|wf| wf.nodes().values())
            .filter(|n| {
                matches!(
                    n.state,
                    crate::types::NodeState::Queued | crate::types::NodeState::Running
                )
            })
            .count()
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

struct ScoredNode {
    node_id: NodeId,
    workflow_id: WorkflowId,
    score: f64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    providers: Arc<ProviderManager>,
    latency: Arc<LatencyEstimateStore>,
    cpu_queue: Arc<BlockingQueue<LocalTask>>,
    io_queue: Arc<BlockingQueue<LocalTask>>,
    trace: TraceLog,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        providers: Arc<ProviderManager>,
        latency: Arc<LatencyEstimateStore>,
        cpu_queue: Arc<BlockingQueue<LocalTask>>,
        io_queue: Arc<BlockingQueue<LocalTask>>,
        trace: TraceLog,
    ) -> Self {
        Scheduler {
            config,
            providers,
            latency,
            cpu_queue,
            io_queue,
            trace,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// P50 service estimate for a node on its preferred tier.
    fn node_estimate(&self, node: &Node) -> f64 {
        node.preference_list
            .first()
            .map(|opt| self.latency.p50(node.node_type, &opt.provider, opt.tier_id))
            .unwrap_or(DEFAULT_ESTIMATE_MS)
    }

    /// Remaining critical path: own estimate plus the longest non-terminal
    /// descendant chain.
    fn remaining_critical_path(&self, wf: &Workflow, nid: NodeId) -> f64 {
        let node = wf.node(nid);
        let est = self.node_estimate(node);
        let max_child = node
            .children
            .iter()
            .map(|c| wf.node(*c))
            .filter(|c| !c.state.is_terminal())
            .map(|c| self.remaining_critical_path(wf, c.id))
            .fold(0.0, f64::max);
        est + max_child
    }

    /// Idle margin before this node's earliest active child must start.
    fn slack(&self, wf: &Workflow, node: &Node) -> f64 {
        let min_child = node
            .children
            .iter()
            .map(|c| wf.node(*c))
            .filter(|c| c.state.is_active())
            .map(|c| self.remaining_critical_path(wf, c.id))
            .fold(f64::INFINITY, f64::min);
        if min_child.is_infinite() {
            return 0.0;
        }
        (min_child - self.node_estimate(node)).max(0.0)
    }

    fn score_and_sort(&self, state: &SimState, now_ms: f64) -> Vec<ScoredNode> {
        let mut wf_ids: Vec<WorkflowId> = state.workflows.keys().copied().collect();
        wf_ids.sort_unstable();

        let mut scored = Vec::new();
        for wf_id in wf_ids {
            let wf = &state.workflows[&wf_id];
            if wf.done() {
                continue;
            }
            let start_ms = state.start_ms.get(&wf_id).copied().unwrap_or(-1.0);
            let age_ms = now_ms - start_ms;
            for nid in wf.runnable_nodes() {
                let node = wf.node(nid);
                let score = if self.config.disable_dag_priority
                    || self.config.policy.scores_by_age_only()
                {
                    age_ms
                } else {
                    let rem_cp = self.remaining_critical_path(wf, nid);
                    let slack = self.slack(wf, node);
                    self.config.alpha * rem_cp
                        + self.config.beta * (1.0 / (1.0 + slack))
                        + self.config.gamma * age_ms
                };
                scored.push(ScoredNode {
                    node_id: nid,
                    workflow_id: wf_id,
                    score,
                });
            }
        }

        // Highest score first; ties resolve by (workflow, node) id so a pass
        // is deterministic for a given state.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .expect("scores are finite")
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        scored
    }

    /// Walks the preference list for the first affordable, accepting option;
    /// critical nodes under an escalating policy may take one step up when
    /// the latency benefit per extra dollar clears the threshold.
    fn select_option<'a>(
        &self,
        node: &'a Node,
        budget_left: f64,
        is_critical: bool,
    ) -> Option<&'a ExecutionOption> {
        let accepting = |opt: &ExecutionOption| -> bool {
            opt.price_per_call <= budget_left
                && self
                    .providers
                    .get(&opt.provider, opt.tier_id)
                    .is_some_and(|t| t.can_accept())
        };

        let chosen_idx = node.preference_list.iter().position(|o| accepting(o))?;
        let chosen = &node.preference_list[chosen_idx];

        if self.config.policy.always_cheapest()
            || self.config.disable_escalation
            || !is_critical
        {
            return Some(chosen);
        }

        // One escalation step: the first affordable, accepting, strictly
        // pricier alternative, taken only if it pays for itself.
        for opt in &node.preference_list[chosen_idx + 1..] {
            if !accepting(opt) {
                continue;
            }
            let delta_cost = opt.price_per_call - chosen.price_per_call;
            if delta_cost <= 0.0 {
                continue;
            }
            let ect_cheap = self
                .latency
                .p95_queue_wait(&chosen.provider, chosen.tier_id)
                + self.latency.p50(node.node_type, &chosen.provider, chosen.tier_id);
            let ect_fast = self.latency.p95_queue_wait(&opt.provider, opt.tier_id)
                + self.latency.p50(node.node_type, &opt.provider, opt.tier_id);
            let benefit = ect_cheap - ect_fast;
            if benefit / delta_cost >= self.config.escalation_benefit_cost_threshold {
                return Some(opt);
            }
            break;
        }
        Some(chosen)
    }

    /// First accepting tier of the node's provider, cheapest-config order.
    /// Used when model routing is disabled.
    fn fallback_tier(&self, node: &Node, budget_left: f64) -> Option<&Arc<Tier>> {
        let provider = node.resource_class.provider_name()?;
        self.providers.tiers().iter().find(|t| {
            &**t.provider() == provider
                && t.can_accept()
                && t.config().price_per_call <= budget_left
        })
    }

    /// One dispatch pass. Returns the number of nodes dispatched.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        state: &mut SimState,
        now_ms: f64,
        next_attempt_id: &AtomicU64,
        cancel_flags: &DashMap<u64, Arc<AtomicBool>>,
        is_critical: &dyn Fn(&Node) -> bool,
        on_dispatch: &mut dyn FnMut(WorkflowId, NodeId, f64),
    ) -> usize {
        let scored = self.score_and_sort(state, now_ms);
        let mut in_flight = state.global_in_flight();
        let mut dispatched = 0;

        for sn in scored {
            if in_flight >= self.config.max_in_flight_global {
                break;
            }

            let budget_left = self.config.budget_per_workflow
                - state.cost.get(&sn.workflow_id).copied().unwrap_or(0.0);

            let wf = state
                .workflows
                .get_mut(&sn.workflow_id)
                .expect("scored workflow exists");
            if wf.done() {
                continue;
            }
            let node = wf.node(sn.node_id);
            if node.state != crate::types::NodeState::Runnable {
                continue;
            }

            let key = node_key(sn.workflow_id, sn.node_id);
            let attempt_id = next_attempt_id.fetch_add(1, Ordering::Relaxed);

            if node.resource_class.is_local() {
                let flag = Arc::new(AtomicBool::new(false));
                cancel_flags.insert(key, Arc::clone(&flag));

                let task = LocalTask {
                    node_id: sn.node_id,
                    workflow_id: sn.workflow_id,
                    node_type: node.node_type,
                    resource_class: node.resource_class,
                    latency_ctx: crate::latency::LatencyContext {
                        node_type: node.node_type,
                        pdf_size_est: node.output_size_est,
                        num_chunks_est: 50,
                        token_length_est: node.output_size_est,
                    },
                    timeout_ms: 5_000,
                    attempt_id,
                    cancelled: flag,
                };
                let queue = match node.resource_class {
                    ResourceClass::Cpu => &self.cpu_queue,
                    ResourceClass::Io => &self.io_queue,
                    _ => unreachable!("is_local checked above"),
                };

                wf.mark_queued(sn.node_id);
                queue.push(task);
                self.trace.emit(
                    TraceEvent::NodeQueued,
                    now_ms,
                    sn.workflow_id,
                    sn.node_id,
                    Some("local".to_string()),
                );
                on_dispatch(sn.workflow_id, sn.node_id, now_ms);
                dispatched += 1;
                in_flight += 1;
                continue;
            }

            // Tier-backed node: routed selection or cheapest-accepting
            // fallback, budget respected on both paths.
            let (tier, timeout_ms, max_retries) =
                if self.config.enable_model_routing && !node.preference_list.is_empty() {
                    let critical = is_critical(node);
                    let Some(opt) = self.select_option(node, budget_left, critical) else {
                        continue;
                    };
                    let Some(tier) = self.providers.get(&opt.provider, opt.tier_id) else {
                        continue;
                    };
                    (Arc::clone(tier), opt.timeout_ms, opt.max_retries)
                } else {
                    let Some(tier) = self.fallback_tier(node, budget_left) else {
                        continue;
                    };
                    let config = tier.config();
                    (
                        Arc::clone(tier),
                        config.default_timeout_ms,
                        config.default_max_retries,
                    )
                };

            let flag = Arc::new(AtomicBool::new(false));
            cancel_flags.insert(key, Arc::clone(&flag));

            let attempt = QueuedAttempt {
                node_id: sn.node_id,
                workflow_id: sn.workflow_id,
                node_type: node.node_type,
                provider: Arc::clone(tier.provider()),
                tier_id: tier.tier_id(),
                tokens_needed: 1.0,
                timeout_ms,
                max_retries,
                latency_ctx: crate::latency::LatencyContext {
                    node_type: node.node_type,
                    pdf_size_est: node.output_size_est,
                    num_chunks_est: 50,
                    token_length_est: node.output_size_est,
                },
                attempt_id,
                cancelled: flag,
                enqueued_at: Instant::now(),
            };

            wf.mark_queued(sn.node_id);
            let label = format!("{}_{}", tier.provider(), tier.tier_id());
            tier.enqueue(attempt);
            self.trace.emit(
                TraceEvent::NodeQueued,
                now_ms,
                sn.workflow_id,
                sn.node_id,
                Some(label),
            );
            on_dispatch(sn.workflow_id, sn.node_id, now_ms);
            dispatched += 1;
            in_flight += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, in_flight, "scheduler pass");
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::latency::LatencyContext;
    use crate::types::NodeType;
    use crate::workflow::WorkloadParams;

    fn make_state(workflow_count: u32, pdfs: u32, subqueries: u32) -> SimState {
        let provider_config = ProviderConfig::default();
        let workflows = (1..=workflow_count).map(|id| {
            Workflow::new(
                id,
                WorkloadParams {
                    pdfs,
                    subqueries_per_iter: subqueries,
                    max_iters: 2,
                    seed: 1,
                },
                &provider_config,
            )
            .unwrap()
        });
        SimState::new(workflows)
    }

    struct Rig {
        scheduler: Scheduler,
        providers: Arc<ProviderManager>,
        cpu_queue: Arc<BlockingQueue<LocalTask>>,
        io_queue: Arc<BlockingQueue<LocalTask>>,
        latency: Arc<LatencyEstimateStore>,
        trace: TraceLog,
        flags: DashMap<u64, Arc<AtomicBool>>,
        next_attempt_id: AtomicU64,
    }

    fn make_rig(config: SchedulerConfig) -> Rig {
        let providers = Arc::new(ProviderManager::new(&ProviderConfig::default()));
        let latency = Arc::new(LatencyEstimateStore::new());
        let cpu_queue = Arc::new(BlockingQueue::new());
        let io_queue = Arc::new(BlockingQueue::new());
        let trace = TraceLog::new();
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&providers),
            Arc::clone(&latency),
            Arc::clone(&cpu_queue),
            Arc::clone(&io_queue),
            trace.clone(),
        );
        Rig {
            scheduler,
            providers,
            cpu_queue,
            io_queue,
            latency,
            trace,
            flags: DashMap::new(),
            next_attempt_id: AtomicU64::new(1),
        }
    }

    fn run_pass(rig: &Rig, state: &mut SimState) -> usize {
        rig.scheduler.dispatch(
            state,
            0.0,
            &rig.next_attempt_id,
            &rig.flags,
            &|n: &Node| n.node_type.is_critical(),
            &mut |_, _, _| {},
        )
    }

    /// Occupies every concurrency slot of a tier with placeholder attempts.
    fn saturate(rig: &Rig, provider: &str, tier_id: u32) {
        let tier = rig.providers.get(provider, tier_id).unwrap();
        for i in 0..tier.concurrency_cap() {
            tier.enqueue(QueuedAttempt {
                node_id: 1000 + i as u64,
                workflow_id: 999,
                node_type: NodeType::Plan,
                provider: Arc::clone(tier.provider()),
                tier_id,
                tokens_needed: 0.0,
                timeout_ms: 1_000,
                max_retries: 0,
                latency_ctx: LatencyContext::new(NodeType::Plan),
                attempt_id: 9_000 + i as u64,
                cancelled: Arc::new(AtomicBool::new(false)),
                enqueued_at: Instant::now(),
            });
            tier.timed_dequeue(std::time::Duration::from_millis(50))
                .unwrap();
        }
        assert!(!tier.can_accept());
    }

    #[test]
    fn dispatches_initial_plan_to_cheapest_llm_tier() {
        let rig = make_rig(SchedulerConfig {
            policy: SchedulerPolicy::FifoCheapest,
            ..SchedulerConfig::default()
        });
        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 1);

        let tier0 = rig.providers.get("llm_provider", 0).unwrap();
        assert_eq!(tier0.queue_len(), 1);
        assert_eq!(
            state.workflows[&1].node(1).state,
            crate::types::NodeState::Queued
        );
        // The cancellation flag for the attempt exists.
        assert!(rig.flags.contains_key(&node_key(1, 1)));
        // And the dispatch was traced.
        assert!(rig
            .trace
            .snapshot()
            .iter()
            .any(|r| r.ev == TraceEvent::NodeQueued
                && r.extra.as_deref() == Some("llm_provider_0")));
    }

    #[test]
    fn local_nodes_route_to_their_pools() {
        let rig = make_rig(SchedulerConfig::default());
        let mut state = make_state(1, 1, 0);
        // Expand iteration 0 so an IO-class LoadPDF becomes runnable.
        let wf = state.workflows.get_mut(&1).unwrap();
        wf.mark_queued(1);
        wf.mark_succeeded(1);

        let dispatched = run_pass(&rig, &mut state);
        // With zero subqueries both LoadPDF (io) and Aggregate (cpu, fed
        // directly by the Plan) are runnable after expansion.
        assert_eq!(dispatched, 2);
        assert_eq!(rig.io_queue.len(), 1);
        assert_eq!(rig.cpu_queue.len(), 1);
    }

    #[test]
    fn budget_starves_expensive_nodes_without_false_progress() {
        let rig = make_rig(SchedulerConfig {
            // Cheapest LLM call costs 0.01; this budget can never pay it.
            budget_per_workflow: 0.005,
            ..SchedulerConfig::default()
        });
        let mut state = make_state(1, 1, 0);
        for _ in 0..5 {
            assert_eq!(run_pass(&rig, &mut state), 0);
        }
        let wf = &state.workflows[&1];
        assert!(!wf.done());
        assert_eq!(wf.node(1).state, crate::types::NodeState::Runnable);
    }

    #[test]
    fn budget_applies_to_routed_dispatch_too() {
        let rig = make_rig(SchedulerConfig {
            enable_model_routing: true,
            budget_per_workflow: 0.005,
            ..SchedulerConfig::default()
        });
        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 0);
        assert_eq!(
            state.workflows[&1].node(1).state,
            crate::types::NodeState::Runnable
        );
    }

    #[test]
    fn global_cap_limits_a_pass() {
        let rig = make_rig(SchedulerConfig {
            max_in_flight_global: 2,
            ..SchedulerConfig::default()
        });
        let mut state = make_state(5, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 2);
        let queued = state
            .workflows
            .values()
            .filter(|wf| wf.node(1).state == crate::types::NodeState::Queued)
            .count();
        assert_eq!(queued, 2);
    }

    #[test]
    fn routed_dispatch_skips_saturated_cheapest_tier() {
        let rig = make_rig(SchedulerConfig {
            enable_model_routing: true,
            policy: SchedulerPolicy::DagCheapest,
            ..SchedulerConfig::default()
        });
        saturate(&rig, "llm_provider", 0);

        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 1);
        let tier1 = rig.providers.get("llm_provider", 1).unwrap();
        assert_eq!(tier1.queue_len(), 1);
    }

    #[test]
    fn escalation_takes_fast_tier_when_benefit_clears_threshold() {
        let rig = make_rig(SchedulerConfig {
            enable_model_routing: true,
            policy: SchedulerPolicy::Full,
            ..SchedulerConfig::default()
        });
        // Teach the store that the cheap LLM tier has a long queue.
        let llm: Arc<str> = Arc::from("llm_provider");
        for _ in 0..50 {
            rig.latency.record_queue_wait(&llm, 0, 5_000.0);
            rig.latency.record_queue_wait(&llm, 1, 10.0);
            rig.latency.record(NodeType::Plan, &llm, 0, 400.0);
            rig.latency.record(NodeType::Plan, &llm, 1, 400.0);
        }

        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 1);
        // benefit ~= 4990ms for 0.04 extra cost: far over the threshold.
        let tier1 = rig.providers.get("llm_provider", 1).unwrap();
        assert_eq!(tier1.queue_len(), 1);
    }

    #[test]
    fn escalation_keeps_cheap_tier_when_benefit_is_small() {
        let rig = make_rig(SchedulerConfig {
            enable_model_routing: true,
            policy: SchedulerPolicy::Full,
            ..SchedulerConfig::default()
        });
        let llm: Arc<str> = Arc::from("llm_provider");
        for _ in 0..50 {
            // Nearly identical expected completion times.
            rig.latency.record_queue_wait(&llm, 0, 20.0);
            rig.latency.record_queue_wait(&llm, 1, 20.0);
            rig.latency.record(NodeType::Plan, &llm, 0, 400.0);
            rig.latency.record(NodeType::Plan, &llm, 1, 400.0);
        }

        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 1);
        let tier0 = rig.providers.get("llm_provider", 0).unwrap();
        assert_eq!(tier0.queue_len(), 1);
    }

    #[test]
    fn disable_escalation_pins_cheapest() {
        let rig = make_rig(SchedulerConfig {
            enable_model_routing: true,
            policy: SchedulerPolicy::Full,
            disable_escalation: true,
            ..SchedulerConfig::default()
        });
        let llm: Arc<str> = Arc::from("llm_provider");
        for _ in 0..50 {
            rig.latency.record_queue_wait(&llm, 0, 5_000.0);
            rig.latency.record_queue_wait(&llm, 1, 10.0);
        }
        let mut state = make_state(1, 1, 0);
        assert_eq!(run_pass(&rig, &mut state), 1);
        let tier0 = rig.providers.get("llm_provider", 0).unwrap();
        assert_eq!(tier0.queue_len(), 1);
    }

    #[test]
    fn fifo_ties_break_by_workflow_then_node() {
        let rig = make_rig(SchedulerConfig {
            policy: SchedulerPolicy::FifoCheapest,
            ..SchedulerConfig::default()
        });
        let mut state = make_state(3, 1, 0);
        let mut order = Vec::new();
        rig.scheduler.dispatch(
            &mut state,
            0.0,
            &rig.next_attempt_id,
            &rig.flags,
            &|n: &Node| n.node_type.is_critical(),
            &mut |wf, nid, _| order.push((wf, nid)),
        );
        // All three initial plans share a score of `age`; dispatch order is
        // the deterministic id order.
        assert_eq!(order, vec![(1, 1), (2, 1), (3, 1)]);
    }
}
