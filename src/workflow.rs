//! Workflow DAG engine: node storage, state machine, dynamic expansion.
//!
//! A workflow starts as a single Plan node. Plan success expands the
//! iteration into per-PDF load/chunk/embed chains, per-subquery
//! search/extract branches, and an aggregate/decide pair. DecideNext success
//! either stops the workflow (pruning later iterations) or opens the next
//! iteration with a fresh Plan.
//!
//! All graph shape and every decision input is a pure function of
//! `(seed, workflow id, iter, pdf, subquery)`, so two runs with the same
//! parameters build byte-identical DAGs regardless of thread timing.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::ProviderConfig;
use crate::error::SimError;
use crate::rng::mix64;
use crate::types::{
    EdgeVec, ExecutionOption, Node, NodeId, NodeState, NodeType, ResourceClass, WorkflowId,
};

/// Per-workflow workload parameters.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadParams {
    pub pdfs: u32,
    pub subqueries_per_iter: u32,
    pub max_iters: u32,
    pub seed: u64,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        WorkloadParams {
            pdfs: 10,
            subqueries_per_iter: 4,
            max_iters: 3,
            seed: 1,
        }
    }
}

/// Outcome of the DecideNext evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideAction {
    Stop,
    Continue,
}

/// A single workflow and its DAG.
pub struct Workflow {
    id: WorkflowId,
    params: WorkloadParams,
    nodes: FxHashMap<NodeId, Node>,
    next_node_id: NodeId,

    done: bool,
    completed_iters: u32,
    stop_iter: Option<u32>,

    // Preference templates per tier-backed resource class, cheapest first.
    embed_options: Vec<ExecutionOption>,
    llm_options: Vec<ExecutionOption>,
}

impl Workflow {
    pub fn new(
        id: WorkflowId,
        params: WorkloadParams,
        provider_config: &ProviderConfig,
    ) -> Result<Self, SimError> {
        if params.pdfs == 0 {
            return Err(SimError::invalid("pdfs", "> 0", 0.0));
        }
        if params.max_iters == 0 {
            return Err(SimError::invalid("max_iters", "> 0", 0.0));
        }

        let mut wf = Workflow {
            id,
            params,
            nodes: FxHashMap::default(),
            next_node_id: 1,
            done: false,
            completed_iters: 0,
            stop_iter: None,
            embed_options: preference_options(provider_config, "embed_provider"),
            llm_options: preference_options(provider_config, "llm_provider"),
        };

        // Root Plan for iteration 0. Output size grows with the workload so
        // token-length-sensitive latency sees bigger plans for bigger runs.
        let plan = wf.add_node(NodeType::Plan, 0, None, None);
        wf.node_mut(plan).output_size_est =
            200 + 10 * params.subqueries_per_iter as u64 + 3 * params.pdfs as u64;

        wf.refresh_runnable();
        Ok(wf)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn params(&self) -> &WorkloadParams {
        &self.params
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn completed_iters(&self) -> u32 {
        self.completed_iters
    }

    pub fn stop_iter(&self) -> Option<u32> {
        self.stop_iter
    }

    pub fn nodes(&self) -> &FxHashMap<NodeId, Node> {
        &self.nodes
    }

    /// Panics on an unknown id: node ids never leave the workflow that
    /// allocated them, so a miss is a bug.
    pub fn node(&self, nid: NodeId) -> &Node {
        self.nodes
            .get(&nid)
            .unwrap_or_else(|| panic!("workflow {}: unknown node id {nid}", self.id))
    }

    pub fn node_mut(&mut self, nid: NodeId) -> &mut Node {
        let id = self.id;
        self.nodes
            .get_mut(&nid)
            .unwrap_or_else(|| panic!("workflow {id}: unknown node id {nid}"))
    }

    /// Ids of all currently runnable nodes, ascending for determinism.
    pub fn runnable_nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Runnable)
            .map(|n| n.id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Nodes with a dispatched or dispatchable attempt.
    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.state.is_active()).count()
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn deps_satisfied(&self, node: &Node) -> bool {
        node.deps
            .iter()
            .all(|d| self.node(*d).state == NodeState::Succeeded)
    }

    /// Central transition gate. Violations are bugs, not recoverable
    /// conditions, and panic with context.
    fn set_state(&mut self, nid: NodeId, next: NodeState) {
        let current = self.node(nid).state;
        if current == next {
            return;
        }
        let satisfied = self.deps_satisfied(self.node(nid));

        let valid = if current.is_terminal() {
            false
        } else {
            match next {
                NodeState::WaitingDeps => !satisfied,
                NodeState::Runnable => satisfied,
                NodeState::Queued => current == NodeState::Runnable,
                // Results apply straight from Queued; nothing enters Running.
                NodeState::Running => false,
                // Runnable is a legal source: a result can arrive for a node
                // another attempt's failure already returned to the pool.
                NodeState::Succeeded | NodeState::Failed => {
                    matches!(current, NodeState::Queued | NodeState::Runnable)
                }
                // Best-effort cancellation from any non-terminal state.
                NodeState::Cancelled => true,
            }
        };

        if !valid {
            panic!(
                "workflow {}: invalid transition {current} -> {next} for node {nid} ({})",
                self.id,
                self.node(nid).node_type
            );
        }
        self.node_mut(nid).state = next;
    }

    /// Recomputes WaitingDeps/Runnable for every non-terminal, non-in-flight
    /// node. Returns the ids that just became runnable.
    pub fn refresh_runnable(&mut self) -> Vec<NodeId> {
        let decisions: Vec<(NodeId, bool)> = self
            .nodes
            .values()
            .filter(|n| !n.state.is_terminal())
            .filter(|n| !matches!(n.state, NodeState::Queued | NodeState::Running))
            .map(|n| (n.id, self.deps_satisfied(n)))
            .collect();

        let mut newly = Vec::new();
        for (nid, ready) in decisions {
            let state = self.node(nid).state;
            if ready && state != NodeState::Runnable {
                self.node_mut(nid).state = NodeState::Runnable;
                newly.push(nid);
            } else if !ready && state != NodeState::WaitingDeps {
                self.node_mut(nid).state = NodeState::WaitingDeps;
            }
        }
        newly.sort_unstable();
        newly
    }

    pub fn mark_queued(&mut self, nid: NodeId) {
        self.set_state(nid, NodeState::Queued);
    }

    /// Applies a successful attempt. Plan success expands the iteration;
    /// DecideNext success evaluates stop/continue. Returns the nodes that
    /// became runnable as a consequence.
    pub fn mark_succeeded(&mut self, nid: NodeId) -> Vec<NodeId> {
        let node_type = self.node(nid).node_type;
        let iter = self.node(nid).iter;

        self.set_state(nid, NodeState::Succeeded);

        match node_type {
            NodeType::Plan => self.expand_iteration(nid),
            NodeType::DecideNext => {
                self.on_decide_next(nid);
                self.completed_iters = self.completed_iters.max(iter + 1);
            }
            _ => {}
        }

        if self.done {
            // Invariant: once done, no node becomes runnable again.
            return Vec::new();
        }
        self.refresh_runnable()
    }

    pub fn mark_failed(&mut self, nid: NodeId) -> Vec<NodeId> {
        self.set_state(nid, NodeState::Failed);
        self.refresh_runnable()
    }

    /// Returns a node with an in-flight attempt to the dispatch pool after a
    /// transient failure. The bounded-retry counterpart of `mark_failed`.
    /// Already-Runnable is a no-op: with a hedge in flight, the other
    /// attempt's failure may have returned the node first.
    pub fn mark_retry(&mut self, nid: NodeId) {
        let state = self.node(nid).state;
        assert!(
            matches!(state, NodeState::Queued | NodeState::Runnable),
            "workflow {}: retry of node {nid} in state {state}",
            self.id
        );
        self.set_state(nid, NodeState::Runnable);
    }

    pub fn cancel(&mut self, nid: NodeId) {
        if self.node(nid).state.is_terminal() {
            return;
        }
        self.set_state(nid, NodeState::Cancelled);
    }

    /// Terminally abandons a workflow whose remaining work is unreachable,
    /// e.g. a node exhausted its retries and its descendants can never run.
    /// Marks the workflow done and cancels everything non-terminal.
    pub fn abandon(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let leftover: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.state.is_terminal())
            .map(|n| n.id)
            .collect();
        for nid in leftover {
            self.set_state(nid, NodeState::Cancelled);
        }
    }

    /// Cancels every non-terminal node of an iteration past `stop_iter`.
    /// Runs after `done` is set, so no refresh happens here: a finished
    /// workflow never produces new runnable nodes.
    pub fn prune_after_stop(&mut self, stop_iter: u32) {
        let doomed: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.state.is_terminal() && n.iter > stop_iter)
            .map(|n| n.id)
            .collect();
        for nid in doomed {
            self.set_state(nid, NodeState::Cancelled);
        }
    }

    // ------------------------------------------------------------------
    // Graph construction
    // ------------------------------------------------------------------

    fn add_node(
        &mut self,
        node_type: NodeType,
        iter: u32,
        pdf_idx: Option<u32>,
        subquery_idx: Option<u32>,
    ) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;

        let resource_class = node_type.resource_class();
        let preference_list = match resource_class {
            ResourceClass::Embed => self.embed_options.clone(),
            ResourceClass::Llm => self.llm_options.clone(),
            ResourceClass::Cpu | ResourceClass::Io => Vec::new(),
        };

        self.nodes.insert(
            id,
            Node {
                id,
                workflow_id: self.id,
                node_type,
                resource_class,
                idempotent: true,
                state: NodeState::WaitingDeps,
                iter,
                pdf_idx,
                subquery_idx,
                deps: EdgeVec::new(),
                children: EdgeVec::new(),
                preference_list,
                output_size_est: 0,
                evidence_count_est: 0,
                attempts_used: 0,
            },
        );
        id
    }

    /// Edges always point from an existing node to a newer one, which keeps
    /// the graph acyclic by construction.
    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        debug_assert!(from < to, "edges must point forward in creation order");
        self.node_mut(from).children.push(to);
        self.node_mut(to).deps.push(from);
    }

    /// Expands iteration `k` after its Plan succeeded: per-PDF chains,
    /// per-subquery branches, aggregate and decide.
    fn expand_iteration(&mut self, plan_node: NodeId) {
        let iter = self.node(plan_node).iter;
        if iter >= self.params.max_iters {
            return;
        }
        // Idempotence guard against replayed Plan success.
        if self
            .nodes
            .values()
            .any(|n| n.node_type == NodeType::Aggregate && n.iter == iter)
        {
            return;
        }

        let pdfs = self.params.pdfs;
        let subqueries = self.params.subqueries_per_iter;
        let mut extract_nodes: Vec<NodeId> =
            Vec::with_capacity(pdfs as usize * subqueries.max(1) as usize);

        for p in 0..pdfs {
            let load = self.add_node(NodeType::LoadPdf, iter, Some(p), None);
            let chunk = self.add_node(NodeType::Chunk, iter, Some(p), None);
            let embed = self.add_node(NodeType::Embed, iter, Some(p), None);
            self.add_edge(plan_node, load);
            self.add_edge(load, chunk);
            self.add_edge(chunk, embed);

            for q in 0..subqueries {
                let search = self.add_node(NodeType::SimilaritySearch, iter, Some(p), Some(q));
                let extract = self.add_node(NodeType::ExtractEvidence, iter, Some(p), Some(q));
                self.node_mut(extract).evidence_count_est =
                    self.evidence_estimate(iter, p, q);
                self.add_edge(embed, search);
                self.add_edge(search, extract);
                extract_nodes.push(extract);
            }
        }

        let aggregate = self.add_node(NodeType::Aggregate, iter, None, None);
        let decide = self.add_node(NodeType::DecideNext, iter, None, None);

        if extract_nodes.is_empty() {
            // No subqueries: the iteration yields no evidence but still
            // progresses through aggregate and decide.
            self.add_edge(plan_node, aggregate);
        } else {
            for extract in extract_nodes {
                self.add_edge(extract, aggregate);
            }
        }
        self.add_edge(aggregate, decide);
    }

    /// Deterministic evidence estimate in 0..=3 for one extract node.
    fn evidence_estimate(&self, iter: u32, pdf: u32, subquery: u32) -> u32 {
        let mixed = self.params.seed
            ^ ((self.id as u64) << 32)
            ^ (iter as u64).wrapping_mul(0x9e3779b97f4a7c15)
            ^ ((pdf as u64) << 8)
            ^ subquery as u64;
        (mix64(mixed) % 4) as u32
    }

    // ------------------------------------------------------------------
    // DecideNext
    // ------------------------------------------------------------------

    fn iter_evidence_total(&self, iter: u32) -> u32 {
        self.nodes
            .values()
            .filter(|n| n.iter == iter && n.node_type == NodeType::ExtractEvidence)
            .map(|n| n.evidence_count_est)
            .sum()
    }

    fn iter_pdf_coverage(&self, iter: u32) -> u32 {
        let covered: FxHashSet<u32> = self
            .nodes
            .values()
            .filter(|n| {
                n.iter == iter
                    && n.node_type == NodeType::ExtractEvidence
                    && n.evidence_count_est > 0
            })
            .filter_map(|n| n.pdf_idx)
            .collect();
        covered.len() as u32
    }

    /// Evidence-based stop/continue rule, deterministic per
    /// `(seed, workflow id, iter)`.
    pub fn compute_decide_action(&self, iter: u32) -> DecideAction {
        if iter + 1 >= self.params.max_iters {
            return DecideAction::Stop;
        }

        let total = self.iter_evidence_total(iter);
        let covered = self.iter_pdf_coverage(iter);

        let coverage = covered as f64 / self.params.pdfs.max(1) as f64;
        let denom = (self.params.pdfs * self.params.subqueries_per_iter.max(1) * 2).max(1);
        let confidence = (total as f64 / denom as f64).min(1.0);

        // Deterministic tie-breaker for borderline evidence.
        let mixed = self.params.seed
            ^ ((self.id as u64) << 1)
            ^ (iter as u64).wrapping_mul(0xD1B54A32D192ED03);
        let u01 = (mix64(mixed) & 0xFFFF) as f64 / 65535.0;

        let strong = coverage >= 0.60 && confidence >= 0.50;
        let borderline = coverage >= 0.45 && confidence >= 0.35 && u01 > 0.70;
        if strong || borderline {
            DecideAction::Stop
        } else {
            DecideAction::Continue
        }
    }

    fn on_decide_next(&mut self, decide_node: NodeId) {
        let iter = self.node(decide_node).iter;

        match self.compute_decide_action(iter) {
            DecideAction::Stop => {
                self.done = true;
                self.stop_iter = Some(iter);
                self.prune_after_stop(iter);
            }
            DecideAction::Continue => {
                let next_iter = iter + 1;
                let plan = self.add_node(NodeType::Plan, next_iter, None, None);
                self.node_mut(plan).output_size_est = 220
                    + 15 * self.params.subqueries_per_iter as u64
                    + 4 * self.params.pdfs as u64;
                self.add_edge(decide_node, plan);
            }
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Kahn's algorithm over the current graph. `None` means a cycle, which
    /// construction is supposed to make impossible.
    pub fn topological_order(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: FxHashMap<NodeId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.deps.len()))
            .collect();
        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(nid) = ready.pop() {
            order.push(nid);
            for child in self.node(nid).children.iter() {
                let d = in_degree
                    .get_mut(child)
                    .expect("child edge points at a known node");
                *d -= 1;
                if *d == 0 {
                    ready.push(*child);
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }
}

/// Execution options for one provider, ascending by price.
fn preference_options(config: &ProviderConfig, provider: &str) -> Vec<ExecutionOption> {
    let mut options: Vec<ExecutionOption> = config
        .tiers
        .iter()
        .filter(|t| &*t.provider == provider)
        .map(|t| ExecutionOption {
            provider: t.provider.clone(),
            tier_id: t.tier_id,
            price_per_call: t.price_per_call,
            timeout_ms: t.default_timeout_ms,
            max_retries: t.default_max_retries,
        })
        .collect();
    options.sort_by(|a, b| {
        a.price_per_call
            .partial_cmp(&b.price_per_call)
            .expect("tier prices are finite")
    });
    options
}
