//! flowsim - discrete-event simulator for an agentic workflow scheduler
//!
//! Simulates N multi-iteration DAG workflows (plan, per-PDF load/chunk/embed,
//! per-subquery search/extract, aggregate, decide-next) dispatched across
//! rate-limited provider tiers and local worker pools, and compares
//! scheduling policies on makespan and cost.
//!
//! ## Architecture
//!
//! - `rng`: seeded xoshiro256** plus the SplitMix64 finalizer
//! - `types`: ids, node/state/resource enums, the `Node` record
//! - `workflow`: DAG engine with dynamic expansion and the decide rule
//! - `config`: run parameters, provider tiers, latency distributions
//! - `estimates`: rolling quantile store feeding scheduling decisions
//! - `latency`: per-node-type service-time and outcome sampling
//! - `queue`: blocking FIFO shared by result and local-task paths
//! - `tier`: token bucket, tier queue, concurrency accounting
//! - `scheduler`: scoring, tier selection, budget, escalation, dispatch
//! - `worker`: tier and local worker loops with cooperative cancellation
//! - `controller`: threads, hedging monitor, result processing, teardown
//! - `trace`: append-only structured event log (trace.json)
//! - `metrics`: per-workflow/tier/summary records and CSV writers
//! - `clock`: real-time to simulated-time mapping
//! - `error`: setup error type

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimates;
pub mod latency;
pub mod metrics;
pub mod queue;
pub mod rng;
pub mod scheduler;
pub mod tier;
pub mod trace;
pub mod types;
pub mod worker;
pub mod workflow;

pub use clock::SimClock;
pub use config::{LatencyConfig, ProviderConfig, SimConfig, TierConfig};
pub use controller::{Controller, SimReport};
pub use error::SimError;
pub use estimates::{LatencyEstimateStore, QuantileEstimator};
pub use latency::{LatencyContext, LatencySample, LatencySampler};
pub use metrics::{SummaryMetrics, TierStats, WorkflowMetrics};
pub use rng::{mix64, SeededRng};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerPolicy, SimState};
pub use tier::{ProviderManager, Tier, TokenBucket};
pub use trace::{TraceEvent, TraceLog, TraceRecord};
pub use types::{Node, NodeId, NodeState, NodeType, ResourceClass, WorkflowId};
pub use worker::{AttemptError, AttemptResult};
pub use workflow::{DecideAction, Workflow, WorkloadParams};
