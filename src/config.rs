//! Run configuration: workload knobs, provider tiers, latency distributions.
//!
//! Provider tiers and latency parameters are build-time constants of the
//! simulated world rather than CLI switches; the CLI only varies the
//! workload, the policy, and the heavy-tail injection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SimError;
use crate::scheduler::SchedulerPolicy;
use crate::types::NodeType;

// ============================================================================
// LATENCY DISTRIBUTIONS
// ============================================================================

/// Service-time distribution family for one node type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LatencyDist {
    /// param1 = mu (log-mean), param2 = sigma.
    Lognormal,
    /// param1 = shape, param2 = scale.
    Gamma,
    /// param1 = base_ms, param2 = coefficient per size unit.
    Linear,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyParams {
    pub dist: LatencyDist,
    pub param1: f64,
    pub param2: f64,
    /// Occasional per-type tail (cache miss, cold shard).
    pub tail_multiplier: f64,
    pub tail_prob: f64,
}

impl LatencyParams {
    fn new(dist: LatencyDist, param1: f64, param2: f64) -> Self {
        LatencyParams {
            dist,
            param1,
            param2,
            tail_multiplier: 1.0,
            tail_prob: 0.0,
        }
    }

    fn with_tail(mut self, multiplier: f64, prob: f64) -> Self {
        self.tail_multiplier = multiplier;
        self.tail_prob = prob;
        self
    }
}

/// Per-node-type latency parameters.
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    load_pdf: LatencyParams,
    chunk: LatencyParams,
    embed: LatencyParams,
    similarity: LatencyParams,
    llm: LatencyParams,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig {
            // LoadPDF: lognormal with an occasional cache-miss tail.
            load_pdf: LatencyParams::new(LatencyDist::Lognormal, 5.0, 0.8).with_tail(3.0, 0.1),
            // Chunk: base + coeff * pdf_size + jitter.
            chunk: LatencyParams::new(LatencyDist::Linear, 50.0, 0.5),
            // Embed: gamma, mean = shape * scale.
            embed: LatencyParams::new(LatencyDist::Gamma, 4.0, 25.0).with_tail(2.0, 0.05),
            // SimilaritySearch: base + coeff * num_chunks.
            similarity: LatencyParams::new(LatencyDist::Linear, 20.0, 2.0),
            // Plan / ExtractEvidence / Aggregate / DecideNext: lognormal,
            // token-length adjusted at sample time.
            llm: LatencyParams::new(LatencyDist::Lognormal, 6.0, 0.8),
        }
    }
}

impl LatencyConfig {
    pub fn params(&self, node_type: NodeType) -> &LatencyParams {
        match node_type {
            NodeType::LoadPdf => &self.load_pdf,
            NodeType::Chunk => &self.chunk,
            NodeType::Embed => &self.embed,
            NodeType::SimilaritySearch => &self.similarity,
            NodeType::Plan | NodeType::ExtractEvidence | NodeType::Aggregate
            | NodeType::DecideNext => &self.llm,
        }
    }
}

// ============================================================================
// PROVIDER TIERS
// ============================================================================

/// One provider tier: token bucket, concurrency, pricing, reliability.
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub provider: Arc<str>,
    pub tier_id: u32,
    pub rate_per_sec: f64,
    pub capacity: f64,
    pub concurrency_cap: u32,
    pub price_per_call: f64,
    pub p_fail: f64,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
}

/// The simulated provider universe: two embedding tiers, two LLM tiers,
/// each pairing a cheap/slow option with a fast/expensive one.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub tiers: Vec<TierConfig>,
    pub latency: LatencyConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let embed: Arc<str> = Arc::from("embed_provider");
        let llm: Arc<str> = Arc::from("llm_provider");
        ProviderConfig {
            tiers: vec![
                TierConfig {
                    provider: Arc::clone(&embed),
                    tier_id: 0,
                    rate_per_sec: 20.0,
                    capacity: 50.0,
                    concurrency_cap: 4,
                    price_per_call: 0.0001,
                    p_fail: 0.02,
                    default_timeout_ms: 10_000,
                    default_max_retries: 3,
                },
                TierConfig {
                    provider: embed,
                    tier_id: 1,
                    rate_per_sec: 100.0,
                    capacity: 200.0,
                    concurrency_cap: 8,
                    price_per_call: 0.0005,
                    p_fail: 0.01,
                    default_timeout_ms: 5_000,
                    default_max_retries: 3,
                },
                TierConfig {
                    provider: Arc::clone(&llm),
                    tier_id: 0,
                    rate_per_sec: 5.0,
                    capacity: 20.0,
                    concurrency_cap: 2,
                    price_per_call: 0.01,
                    p_fail: 0.03,
                    default_timeout_ms: 30_000,
                    default_max_retries: 3,
                },
                TierConfig {
                    provider: llm,
                    tier_id: 1,
                    rate_per_sec: 20.0,
                    capacity: 50.0,
                    concurrency_cap: 4,
                    price_per_call: 0.05,
                    p_fail: 0.02,
                    default_timeout_ms: 15_000,
                    default_max_retries: 3,
                },
            ],
            latency: LatencyConfig::default(),
        }
    }
}

// ============================================================================
// RUN CONFIG
// ============================================================================

/// Full configuration for one simulator run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub workflows: u32,
    pub pdfs: u32,
    pub iters: u32,
    pub subqueries: u32,
    pub policy: SchedulerPolicy,
    pub seed: u64,
    pub time_scale: u32,
    pub out_dir: PathBuf,

    pub enable_model_routing: bool,
    pub disable_hedging: bool,
    pub disable_escalation: bool,
    pub disable_dag_priority: bool,

    pub heavy_tail_prob: f64,
    pub heavy_tail_mult: f64,

    // Knobs below are not CLI-exposed; tests and embedders set them directly.
    pub budget_per_workflow: f64,
    pub max_in_flight_global: usize,
    pub straggler_stretch_threshold: f64,
    pub scheduler_interval: Duration,
    pub monitor_interval: Duration,
    pub cpu_workers: usize,
    pub io_workers: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            workflows: 100,
            pdfs: 10,
            iters: 3,
            subqueries: 4,
            policy: SchedulerPolicy::Full,
            seed: 1,
            time_scale: 50,
            out_dir: PathBuf::from("out"),
            enable_model_routing: false,
            disable_hedging: false,
            disable_escalation: false,
            disable_dag_priority: false,
            heavy_tail_prob: 0.02,
            heavy_tail_mult: 50.0,
            budget_per_workflow: 10.0,
            max_in_flight_global: 200,
            straggler_stretch_threshold: 1.5,
            scheduler_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(100),
            cpu_workers: 4,
            io_workers: 2,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.workflows == 0 {
            return Err(SimError::invalid("workflows", "> 0", 0.0));
        }
        if self.pdfs == 0 {
            return Err(SimError::invalid("pdfs", "> 0", 0.0));
        }
        if self.iters == 0 {
            return Err(SimError::invalid("iters", "> 0", 0.0));
        }
        if self.time_scale == 0 {
            return Err(SimError::invalid("time_scale", "> 0", 0.0));
        }
        if self.out_dir.as_os_str().is_empty() {
            return Err(SimError::EmptyOutDir);
        }
        if !(0.0..=1.0).contains(&self.heavy_tail_prob) {
            return Err(SimError::invalid(
                "heavy_tail_prob",
                "within [0, 1]",
                self.heavy_tail_prob,
            ));
        }
        if self.heavy_tail_mult < 1.0 {
            return Err(SimError::invalid(
                "heavy_tail_mult",
                ">= 1",
                self.heavy_tail_mult,
            ));
        }
        Ok(())
    }
}
