//! End-to-end runs through the real controller: threads, tiers, hedging,
//! trace and CSV outputs. Workloads are kept small and time_scale high so
//! each run finishes in a few wall-clock seconds.

use std::path::PathBuf;
use std::time::Duration;

use flowsim::metrics::{write_summary_csv, write_tiers_csv, write_workflows_csv};
use flowsim::trace::TraceEvent;
use flowsim::{Controller, ProviderConfig, SchedulerPolicy, SimConfig};

fn base_config(out_dir: PathBuf) -> SimConfig {
    SimConfig {
        workflows: 1,
        pdfs: 1,
        iters: 1,
        subqueries: 0,
        policy: SchedulerPolicy::FifoCheapest,
        seed: 1,
        time_scale: 1_000,
        out_dir,
        heavy_tail_prob: 0.0,
        heavy_tail_mult: 1.0,
        scheduler_interval: Duration::from_millis(10),
        monitor_interval: Duration::from_millis(20),
        ..SimConfig::default()
    }
}

#[test]
fn trivial_sequential_workflow_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf());

    let mut controller = Controller::new(config).unwrap();
    let trace = controller.trace();
    let report = controller.run();

    assert_eq!(report.workflow_metrics.len(), 1);
    let m = &report.workflow_metrics[0];
    assert_eq!(m.workflow_id, 1);
    assert!(m.makespan_ms > 0.0);
    // Plan and DecideNext both ran on an LLM tier, so cost accrued.
    assert!(m.cost > 0.0);

    let records = trace.snapshot();
    assert!(records
        .iter()
        .any(|r| r.ev == TraceEvent::WorkflowDone && r.wf == 1));
    assert!(records.iter().any(|r| r.ev == TraceEvent::NodeRunnable));
    assert!(records.iter().any(|r| r.ev == TraceEvent::NodeQueued));
    assert!(records.iter().any(|r| r.ev == TraceEvent::AttemptStart));
    assert!(records
        .iter()
        .any(|r| r.ev == TraceEvent::AttemptFinish && r.extra.as_deref() == Some("ok")));

    // Summary over a single workflow collapses onto its values.
    assert_eq!(report.summary.makespan_p50_ms, m.makespan_ms);
    assert!((report.summary.cost_mean - m.cost).abs() < 1e-9);
}

#[test]
fn multi_workflow_full_policy_run_terminates_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let config = SimConfig {
        workflows: 3,
        pdfs: 2,
        iters: 2,
        subqueries: 1,
        policy: SchedulerPolicy::Full,
        enable_model_routing: true,
        seed: 7,
        time_scale: 2_000,
        ..base_config(dir.path().to_path_buf())
    };
    let budget = config.budget_per_workflow;

    let mut controller = Controller::new(config.clone()).unwrap();
    let trace = controller.trace();
    let report = controller.run();

    assert_eq!(report.workflow_metrics.len(), 3);
    for m in &report.workflow_metrics {
        assert!(m.makespan_ms > 0.0);
        // This workload is far too small to exhaust the per-workflow budget.
        assert!(m.cost <= budget, "workflow {} overspent", m.workflow_id);
    }
    assert!(report.summary.makespan_mean_ms > 0.0);
    assert!(report.summary.makespan_p95_ms >= report.summary.makespan_p50_ms);

    // Tier stats cover the whole configured universe.
    assert_eq!(report.tier_stats.len(), 4);

    // One WorkflowDone per workflow.
    let records = trace.snapshot();
    for wf in 1..=3u32 {
        assert_eq!(
            records
                .iter()
                .filter(|r| r.ev == TraceEvent::WorkflowDone && r.wf == wf)
                .count(),
            1
        );
    }

    // Output files land in out_dir and parse.
    trace.write_json(&dir.path().join("trace.json")).unwrap();
    write_workflows_csv(dir.path(), &report.workflow_metrics).unwrap();
    write_tiers_csv(dir.path(), &report.tier_stats).unwrap();
    write_summary_csv(dir.path(), &report.summary).unwrap();
    for file in ["trace.json", "workflows.csv", "tiers.csv", "summary.csv"] {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }
    let text = std::fs::read_to_string(dir.path().join("trace.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(parsed.as_array().unwrap().len() >= records.len());
}

#[test]
fn straggler_hedge_launches_and_winner_precedes_loser_cancel() {
    // Every attempt is hit by a 100x heavy tail, the stretch threshold is
    // 1.0, and the monitor runs often: queued critical nodes are certain to
    // be flagged as stragglers while their first attempt sleeps.
    let dir = tempfile::tempdir().unwrap();
    let config = SimConfig {
        workflows: 1,
        pdfs: 1,
        iters: 1,
        subqueries: 1,
        policy: SchedulerPolicy::Full,
        enable_model_routing: true,
        seed: 11,
        time_scale: 50,
        heavy_tail_prob: 1.0,
        heavy_tail_mult: 100.0,
        straggler_stretch_threshold: 1.0,
        ..base_config(dir.path().to_path_buf())
    };

    let mut controller = Controller::new(config).unwrap();
    let trace = controller.trace();
    let report = controller.run();

    assert_eq!(report.workflow_metrics.len(), 1);
    let records = trace.snapshot();

    let hedges: Vec<_> = records
        .iter()
        .filter(|r| r.ev == TraceEvent::HedgeLaunched)
        .collect();
    assert!(!hedges.is_empty(), "no hedge launched under forced stretch");
    assert!(report.workflow_metrics[0].hedges_launched >= 1);

    // Whenever a hedge loser was cancelled, the winning finish for the same
    // node appears earlier in the trace.
    for (idx, record) in records.iter().enumerate() {
        if record.ev == TraceEvent::AttemptCancel {
            let winner_before = records[..idx]
                .iter()
                .any(|r| r.ev == TraceEvent::AttemptFinish && r.node == record.node);
            assert!(
                winner_before,
                "AttemptCancel for node {} without an earlier AttemptFinish",
                record.node
            );
        }
    }
}

#[test]
fn permanent_failure_terminates_workflow_gracefully() {
    // Every LLM attempt fails, so the initial Plan burns its retry budget
    // and goes Failed; nothing downstream can ever run. The controller must
    // close the workflow out instead of hanging or panicking.
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path().to_path_buf());

    let mut providers = ProviderConfig::default();
    for tier in &mut providers.tiers {
        if &*tier.provider == "llm_provider" {
            tier.p_fail = 1.0;
        }
    }

    let mut controller = Controller::with_providers(config, providers).unwrap();
    let trace = controller.trace();
    let report = controller.run();

    assert_eq!(report.workflow_metrics.len(), 1);
    let m = &report.workflow_metrics[0];
    assert_eq!(m.retries, 3, "default retry budget should be exhausted");
    assert!(m.cost > 0.0, "failed attempts are still billed");

    let records = trace.snapshot();
    // One failure per attempt: the first try plus three retries.
    let fails = records
        .iter()
        .filter(|r| r.ev == TraceEvent::AttemptFail && r.extra.as_deref() == Some("failed"))
        .count();
    assert_eq!(fails, 4);
    // The workflow still reaches WorkflowDone, marked as a failure.
    assert!(records.iter().any(|r| r.ev == TraceEvent::WorkflowDone
        && r.wf == 1
        && r.extra.as_deref() == Some("failed")));
    // The plan never finished successfully.
    assert!(!records.iter().any(|r| r.ev == TraceEvent::AttemptFinish));
}

#[test]
fn rejects_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.workflows = 0;
    assert!(Controller::new(config).is_err());

    let mut config = base_config(dir.path().to_path_buf());
    config.heavy_tail_prob = 2.0;
    assert!(Controller::new(config).is_err());
}

#[test]
fn fifo_and_full_policies_complete_the_same_workload() {
    for policy in [SchedulerPolicy::FifoCheapest, SchedulerPolicy::Full] {
        let dir = tempfile::tempdir().unwrap();
        let config = SimConfig {
            workflows: 2,
            pdfs: 1,
            iters: 2,
            subqueries: 1,
            policy,
            seed: 3,
            ..base_config(dir.path().to_path_buf())
        };
        let mut controller = Controller::new(config).unwrap();
        let report = controller.run();
        assert_eq!(report.workflow_metrics.len(), 2, "policy {policy}");
    }
}
