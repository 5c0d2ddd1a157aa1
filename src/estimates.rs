//! Rolling latency estimates feeding scheduling decisions.
//!
//! `QuantileEstimator` keeps a bounded window of recent samples and computes
//! quantiles by sorting the window on read; cheap at these sample counts and
//! exact, which matters for test reproducibility. `LatencyEstimateStore` is
//! the shared view: service-time quantiles keyed by
//! (node type, provider, tier) and queue-wait quantiles per (provider, tier).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::NodeType;

/// Cold-start defaults returned before any sample arrives. Deliberately
/// conservative so early escalation decisions lean cheap.
const DEFAULT_P50_MS: f64 = 100.0;
const DEFAULT_P90_MS: f64 = 200.0;
const DEFAULT_P95_MS: f64 = 300.0;
const DEFAULT_QUEUE_WAIT_P95_MS: f64 = 50.0;

const WINDOW: usize = 1000;

/// Bounded-window quantile estimator.
#[derive(Debug, Clone)]
pub struct QuantileEstimator {
    samples: VecDeque<f64>,
    max_samples: usize,
}

impl Default for QuantileEstimator {
    fn default() -> Self {
        QuantileEstimator::new(WINDOW)
    }
}

impl QuantileEstimator {
    pub fn new(max_samples: usize) -> Self {
        QuantileEstimator {
            samples: VecDeque::with_capacity(max_samples.min(WINDOW)),
            max_samples: max_samples.max(1),
        }
    }

    pub fn add(&mut self, value: f64) {
        self.samples.push_back(value);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    fn quantile(&self, q: f64, default: f64) -> f64 {
        if self.samples.is_empty() {
            return default;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
        let idx = ((q * sorted.len() as f64) as usize).min(sorted.len() - 1);
        sorted[idx]
    }

    pub fn p50(&self) -> f64 {
        self.quantile(0.50, DEFAULT_P50_MS)
    }

    pub fn p90(&self) -> f64 {
        self.quantile(0.90, DEFAULT_P90_MS)
    }

    pub fn p95(&self) -> f64 {
        self.quantile(0.95, DEFAULT_P95_MS)
    }
}

type ServiceKey = (NodeType, Arc<str>, u32);
type QueueKey = (Arc<str>, u32);

/// Thread-safe store of rolling latency estimates.
#[derive(Default)]
pub struct LatencyEstimateStore {
    service: Mutex<FxHashMap<ServiceKey, QuantileEstimator>>,
    queue_wait: Mutex<FxHashMap<QueueKey, QuantileEstimator>>,
}

impl LatencyEstimateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node_type: NodeType, provider: &Arc<str>, tier_id: u32, duration_ms: f64) {
        let mut map = self.service.lock();
        map.entry((node_type, Arc::clone(provider), tier_id))
            .or_default()
            .add(duration_ms);
    }

    pub fn p50(&self, node_type: NodeType, provider: &Arc<str>, tier_id: u32) -> f64 {
        let map = self.service.lock();
        map.get(&(node_type, Arc::clone(provider), tier_id))
            .map(|est| est.p50())
            .unwrap_or(DEFAULT_P50_MS)
    }

    pub fn p95(&self, node_type: NodeType, provider: &Arc<str>, tier_id: u32) -> f64 {
        let map = self.service.lock();
        map.get(&(node_type, Arc::clone(provider), tier_id))
            .map(|est| est.p95())
            .unwrap_or(DEFAULT_P95_MS)
    }

    pub fn record_queue_wait(&self, provider: &Arc<str>, tier_id: u32, wait_ms: f64) {
        let mut map = self.queue_wait.lock();
        map.entry((Arc::clone(provider), tier_id))
            .or_default()
            .add(wait_ms);
    }

    pub fn p95_queue_wait(&self, provider: &Arc<str>, tier_id: u32) -> f64 {
        let map = self.queue_wait.lock();
        map.get(&(Arc::clone(provider), tier_id))
            .map(|est| est.p95())
            .unwrap_or(DEFAULT_QUEUE_WAIT_P95_MS)
    }
}
