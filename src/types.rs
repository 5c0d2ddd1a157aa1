//! Core identifiers and node model for workflow DAGs.
//!
//! A workflow is a map of `Node`s connected by dependency edges; node ids
//! are allocated sequentially per workflow, so edges always point from an
//! older node to a newer one and the graph stays acyclic by construction.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub type WorkflowId = u32;
pub type NodeId = u64;
pub type AttemptId = u64;

/// Edge lists are stack-allocated for the common small fan-out.
pub type EdgeVec = SmallVec<[NodeId; 4]>;

/// The task kinds making up one iteration of an agentic retrieval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum NodeType {
    Plan,
    LoadPdf,
    Chunk,
    Embed,
    SimilaritySearch,
    ExtractEvidence,
    Aggregate,
    DecideNext,
}

impl NodeType {
    /// Resource class a node of this type executes on.
    pub fn resource_class(self) -> ResourceClass {
        match self {
            NodeType::LoadPdf => ResourceClass::Io,
            NodeType::Chunk | NodeType::SimilaritySearch | NodeType::Aggregate => {
                ResourceClass::Cpu
            }
            NodeType::Embed => ResourceClass::Embed,
            NodeType::Plan | NodeType::ExtractEvidence | NodeType::DecideNext => ResourceClass::Llm,
        }
    }

    /// Critical node types drive iteration progress and are eligible for
    /// escalation and hedging.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            NodeType::Plan | NodeType::Aggregate | NodeType::DecideNext | NodeType::ExtractEvidence
        )
    }

    /// LLM-shaped types get the token-length latency adjustment.
    pub fn is_token_sensitive(self) -> bool {
        matches!(
            self,
            NodeType::Plan | NodeType::ExtractEvidence | NodeType::DecideNext
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Plan => "Plan",
            NodeType::LoadPdf => "LoadPDF",
            NodeType::Chunk => "Chunk",
            NodeType::Embed => "Embed",
            NodeType::SimilaritySearch => "SimilaritySearch",
            NodeType::ExtractEvidence => "ExtractEvidence",
            NodeType::Aggregate => "Aggregate",
            NodeType::DecideNext => "DecideNext",
        };
        f.write_str(name)
    }
}

/// Where an attempt runs: local CPU/IO pools or a provider tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceClass {
    Cpu = 0,
    Io = 1,
    Embed = 2,
    Llm = 3,
}

impl ResourceClass {
    pub fn is_local(self) -> bool {
        matches!(self, ResourceClass::Cpu | ResourceClass::Io)
    }

    /// Provider name serving this class, if it is tier-backed.
    pub fn provider_name(self) -> Option<&'static str> {
        match self {
            ResourceClass::Embed => Some("embed_provider"),
            ResourceClass::Llm => Some("llm_provider"),
            ResourceClass::Cpu | ResourceClass::Io => None,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceClass::Cpu => "cpu",
            ResourceClass::Io => "io",
            ResourceClass::Embed => "embed",
            ResourceClass::Llm => "llm",
        };
        f.write_str(name)
    }
}

/// Node lifecycle states. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    WaitingDeps,
    Runnable,
    Queued,
    /// Occupied by a worker. Dispatch applies results straight from
    /// `Queued`, so nothing transitions into this state.
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Cancelled
        )
    }

    /// Active states either are dispatchable or have an attempt in flight.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeState::Runnable | NodeState::Queued | NodeState::Running
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One (provider, tier) alternative a node may run on.
#[derive(Debug, Clone)]
pub struct ExecutionOption {
    pub provider: Arc<str>,
    pub tier_id: u32,
    pub price_per_call: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

/// A task node in a workflow DAG.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub workflow_id: WorkflowId,
    pub node_type: NodeType,
    pub resource_class: ResourceClass,
    pub idempotent: bool,
    pub state: NodeState,

    /// Iteration this node belongs to.
    pub iter: u32,
    pub pdf_idx: Option<u32>,
    pub subquery_idx: Option<u32>,

    pub deps: EdgeVec,
    pub children: EdgeVec,

    /// Alternatives sorted ascending by price; index 0 is the cheapest.
    pub preference_list: Vec<ExecutionOption>,

    /// Deterministic estimates driving latency sampling and DecideNext.
    pub output_size_est: u64,
    pub evidence_count_est: u32,

    /// Attempts applied so far; drives the bounded-retry extension.
    pub attempts_used: u32,
}

/// Composite key identifying a `(workflow, node)` pair in flag and timing
/// maps. Node ids are per-workflow sequential and stay far below 2^32.
#[inline]
pub fn node_key(workflow_id: WorkflowId, node_id: NodeId) -> u64 {
    ((workflow_id as u64) << 32) | node_id
}
