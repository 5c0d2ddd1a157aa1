//! Per-workflow and per-tier metrics plus the CSV writers.
//!
//! Writers are dumb sinks: they consume fully computed records and format
//! rows, no simulation logic. Column order is part of the output contract.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::types::WorkflowId;

/// One finished workflow's line in workflows.csv.
#[derive(Debug, Clone)]
pub struct WorkflowMetrics {
    pub workflow_id: WorkflowId,
    pub makespan_ms: f64,
    pub cost: f64,
    pub retries: u32,
    pub cancellations: u32,
    pub hedges_launched: u32,
    pub wasted_ms: f64,
}

/// One tier's line in tiers.csv.
#[derive(Debug, Clone)]
pub struct TierStats {
    pub provider: Arc<str>,
    pub tier_id: u32,
    pub utilization: f64,
    pub queue_wait_p95_ms: f64,
    pub in_flight_avg: f64,
}

/// The single summary.csv row.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryMetrics {
    pub makespan_mean_ms: f64,
    pub makespan_p50_ms: f64,
    pub makespan_p95_ms: f64,
    pub makespan_p99_ms: f64,
    pub cost_mean: f64,
    pub cost_p50: f64,
}

/// Aggregates finished-workflow metrics into the summary row.
pub fn summarize(metrics: &[WorkflowMetrics]) -> SummaryMetrics {
    if metrics.is_empty() {
        return SummaryMetrics::default();
    }

    let mut makespans: Vec<f64> = metrics.iter().map(|m| m.makespan_ms).collect();
    let mut costs: Vec<f64> = metrics.iter().map(|m| m.cost).collect();
    makespans.sort_by(|a, b| a.partial_cmp(b).expect("makespans are finite"));
    costs.sort_by(|a, b| a.partial_cmp(b).expect("costs are finite"));

    let n = makespans.len();
    let at = |sorted: &[f64], q: f64| -> f64 {
        let idx = ((q * n as f64) as usize).min(n - 1);
        sorted[idx]
    };

    SummaryMetrics {
        makespan_mean_ms: makespans.iter().sum::<f64>() / n as f64,
        makespan_p50_ms: at(&makespans, 0.50),
        makespan_p95_ms: at(&makespans, 0.95),
        makespan_p99_ms: at(&makespans, 0.99),
        cost_mean: costs.iter().sum::<f64>() / n as f64,
        cost_p50: at(&costs, 0.50),
    }
}

fn write_csv(path: &Path, header: &str, rows: &[String]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{header}")?;
    for row in rows {
        writeln!(out, "{row}")?;
    }
    out.flush()
}

pub fn write_workflows_csv(out_dir: &Path, metrics: &[WorkflowMetrics]) -> std::io::Result<()> {
    let rows: Vec<String> = metrics
        .iter()
        .map(|m| {
            format!(
                "{},{},{},{},{},{},{}",
                m.workflow_id,
                m.makespan_ms,
                m.cost,
                m.retries,
                m.cancellations,
                m.hedges_launched,
                m.wasted_ms
            )
        })
        .collect();
    write_csv(
        &out_dir.join("workflows.csv"),
        "workflow_id,makespan_ms,cost,retries,cancellations,hedges_launched,wasted_ms",
        &rows,
    )
}

pub fn write_tiers_csv(out_dir: &Path, stats: &[TierStats]) -> std::io::Result<()> {
    let rows: Vec<String> = stats
        .iter()
        .map(|s| {
            format!(
                "{},{},{},{},{}",
                s.provider, s.tier_id, s.utilization, s.queue_wait_p95_ms, s.in_flight_avg
            )
        })
        .collect();
    write_csv(
        &out_dir.join("tiers.csv"),
        "provider,tier_id,utilization,queue_wait_p95_ms,in_flight_avg",
        &rows,
    )
}

pub fn write_summary_csv(out_dir: &Path, summary: &SummaryMetrics) -> std::io::Result<()> {
    let row = format!(
        "{},{},{},{},{},{}",
        summary.makespan_mean_ms,
        summary.makespan_p50_ms,
        summary.makespan_p95_ms,
        summary.makespan_p99_ms,
        summary.cost_mean,
        summary.cost_p50
    );
    write_csv(
        &out_dir.join("summary.csv"),
        "makespan_mean_ms,makespan_p50_ms,makespan_p95_ms,makespan_p99_ms,cost_mean,cost_p50",
        &[row],
    )
}
