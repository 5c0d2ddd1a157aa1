//! Service-time and outcome sampling for simulated attempts.
//!
//! Each node type has a configured distribution (lognormal, gamma, or
//! linear-in-size). Sampling happens in the worker thread right before the
//! simulated sleep: raw service time, per-type heavy tail, transient-failure
//! Bernoulli, then the timeout clamp. Everything draws from one shared
//! seeded RNG so a run is reproducible up to thread interleaving.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{LatencyConfig, LatencyDist};
use crate::rng::SeededRng;
use crate::types::NodeType;

/// Size estimates a node carries into sampling.
#[derive(Debug, Clone, Copy)]
pub struct LatencyContext {
    pub node_type: NodeType,
    pub pdf_size_est: u64,
    pub num_chunks_est: u32,
    pub token_length_est: u64,
}

impl LatencyContext {
    pub fn new(node_type: NodeType) -> Self {
        LatencyContext {
            node_type,
            pdf_size_est: 0,
            num_chunks_est: 0,
            token_length_est: 100,
        }
    }
}

/// Outcome of sampling one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub service_time_ms: f64,
    pub failed: bool,
    pub timeout: bool,
}

/// Samples service times and attempt outcomes from the shared RNG.
pub struct LatencySampler {
    config: LatencyConfig,
    rng: Arc<Mutex<SeededRng>>,
}

impl LatencySampler {
    pub fn new(config: LatencyConfig, rng: Arc<Mutex<SeededRng>>) -> Self {
        LatencySampler { config, rng }
    }

    /// One Bernoulli draw from the shared stream. Used by workers for the
    /// run-level heavy-tail injection.
    pub fn bernoulli(&self, p: f64) -> bool {
        self.rng.lock().bernoulli(p)
    }

    /// Raw service time for a node, with the per-type tail applied.
    /// Always at least 1 ms.
    pub fn sample_service_time(&self, ctx: &LatencyContext) -> f64 {
        let params = self.config.params(ctx.node_type);
        let mut rng = self.rng.lock();
        let raw = match params.dist {
            LatencyDist::Lognormal => {
                let mut mu = params.param1;
                if ctx.node_type.is_token_sensitive() {
                    mu += 0.001 * ctx.token_length_est as f64;
                }
                rng.lognormal(mu, params.param2)
            }
            LatencyDist::Gamma => rng.gamma(params.param1, params.param2),
            LatencyDist::Linear => {
                let base = params.param1;
                let coeff = params.param2;
                let raw = match ctx.node_type {
                    NodeType::Chunk => {
                        base + coeff * ctx.pdf_size_est as f64 + rng.uniform(-5.0, 5.0)
                    }
                    NodeType::SimilaritySearch => base + coeff * ctx.num_chunks_est as f64,
                    _ => base + rng.uniform(-2.0, 2.0),
                };
                raw.max(1.0)
            }
        };
        let tailed = if params.tail_prob > 0.0 && rng.bernoulli(params.tail_prob) {
            raw * params.tail_multiplier
        } else {
            raw
        };
        tailed.max(1.0)
    }

    /// Full attempt sample: service time, then failure, then timeout clamp.
    pub fn sample(&self, ctx: &LatencyContext, timeout_ms: u64, p_fail: f64) -> LatencySample {
        let mut sample = LatencySample {
            service_time_ms: self.sample_service_time(ctx),
            failed: false,
            timeout: false,
        };

        if self.bernoulli(p_fail) {
            sample.failed = true;
            return sample;
        }

        if timeout_ms > 0 && sample.service_time_ms > timeout_ms as f64 {
            sample.timeout = true;
            sample.service_time_ms = timeout_ms as f64;
        }

        sample
    }
}
