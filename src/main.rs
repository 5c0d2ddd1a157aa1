//! flowsim CLI - agentic workflow scheduler simulation
//!
//! Usage:
//!   flowsim [--workflows N] [--pdfs N] [--iters N] [--subqueries N]
//!           [--policy NAME] [--seed N] [--time_scale N] [--out_dir PATH]
//!           [--enable_model_routing] [--disable_hedging]
//!           [--disable_escalation] [--disable_dag_priority]
//!           [--heavy_tail_prob P] [--heavy_tail_mult M]
//!
//! Writes workflows.csv, tiers.csv, summary.csv, and trace.json into the
//! output directory and prints the summary block.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;

use flowsim::metrics;
use flowsim::{Controller, SchedulerPolicy, SimConfig, SimReport};

#[derive(Parser)]
#[command(name = "flowsim")]
#[command(version = "0.1.0")]
#[command(about = "Discrete-event simulator for an agentic workflow scheduler", long_about = None)]
struct Cli {
    /// Number of workflows simulated
    #[arg(long, default_value_t = 100)]
    workflows: u32,

    /// PDFs per workflow
    #[arg(long, default_value_t = 10)]
    pdfs: u32,

    /// Max iterations per workflow
    #[arg(long, default_value_t = 3)]
    iters: u32,

    /// Subqueries per iteration
    #[arg(long, default_value_t = 4)]
    subqueries: u32,

    /// Scheduling policy
    #[arg(long, value_enum, default_value_t = SchedulerPolicy::Full)]
    policy: SchedulerPolicy,

    /// RNG seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Divides simulated sleeps (larger = faster wall clock)
    #[arg(long = "time_scale", default_value_t = 50)]
    time_scale: u32,

    /// Output directory (created if absent)
    #[arg(long = "out_dir", default_value = "out")]
    out_dir: PathBuf,

    /// Enable preference-list routing, escalation, and hedging
    #[arg(long = "enable_model_routing")]
    enable_model_routing: bool,

    /// Disable the straggler hedge
    #[arg(long = "disable_hedging")]
    disable_hedging: bool,

    /// Always pick the cheapest eligible tier
    #[arg(long = "disable_escalation")]
    disable_escalation: bool,

    /// Fall back to age-only scoring
    #[arg(long = "disable_dag_priority")]
    disable_dag_priority: bool,

    /// Fraction of attempts hit by the heavy-tail multiplier
    #[arg(long = "heavy_tail_prob", default_value_t = 0.02)]
    heavy_tail_prob: f64,

    /// Service-time multiplier for heavy-tail attempts
    #[arg(long = "heavy_tail_mult", default_value_t = 50.0)]
    heavy_tail_mult: f64,
}

impl Cli {
    fn into_config(self) -> SimConfig {
        SimConfig {
            workflows: self.workflows,
            pdfs: self.pdfs,
            iters: self.iters,
            subqueries: self.subqueries,
            policy: self.policy,
            seed: self.seed,
            time_scale: self.time_scale,
            out_dir: self.out_dir,
            enable_model_routing: self.enable_model_routing,
            disable_hedging: self.disable_hedging,
            disable_escalation: self.disable_escalation,
            disable_dag_priority: self.disable_dag_priority,
            heavy_tail_prob: self.heavy_tail_prob,
            heavy_tail_mult: self.heavy_tail_mult,
            ..SimConfig::default()
        }
    }
}

fn main() -> ExitCode {
    // clap exits with code 2 on usage errors, matching the CLI contract.
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(cli.into_config()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            eprintln!("Run with --help for usage.");
            ExitCode::from(2)
        }
    }
}

fn run(config: SimConfig) -> anyhow::Result<()> {
    config
        .validate()
        .context("invalid configuration")?;

    std::fs::create_dir_all(&config.out_dir).with_context(|| {
        format!("failed to create out_dir '{}'", config.out_dir.display())
    })?;

    print_config(&config);

    let mut controller = Controller::new(config.clone()).context("simulation setup failed")?;
    let trace = controller.trace();
    let report = controller.run();

    trace
        .write_json(&config.out_dir.join("trace.json"))
        .context("failed to write trace.json")?;
    metrics::write_workflows_csv(&config.out_dir, &report.workflow_metrics)
        .context("failed to write workflows.csv")?;
    metrics::write_tiers_csv(&config.out_dir, &report.tier_stats)
        .context("failed to write tiers.csv")?;
    metrics::write_summary_csv(&config.out_dir, &report.summary)
        .context("failed to write summary.csv")?;

    print_summary(&config, &report);
    Ok(())
}

fn print_config(config: &SimConfig) {
    println!("{}", "flowsim config:".cyan().bold());
    println!("  workflows={}", config.workflows);
    println!("  pdfs={}", config.pdfs);
    println!("  iters={}", config.iters);
    println!("  subqueries={}", config.subqueries);
    println!("  policy={}", config.policy);
    println!("  seed={}", config.seed);
    println!("  time_scale={}", config.time_scale);
    println!("  out_dir={}", config.out_dir.display());
    println!("  enable_model_routing={}", config.enable_model_routing);
    println!("  disable_hedging={}", config.disable_hedging);
    println!("  disable_escalation={}", config.disable_escalation);
    println!("  disable_dag_priority={}", config.disable_dag_priority);
}

fn print_summary(config: &SimConfig, report: &SimReport) {
    let summary = &report.summary;
    println!("{}", "summary:".cyan().bold());
    println!("  makespan_mean_ms={}", summary.makespan_mean_ms);
    println!("  makespan_p95_ms={}", summary.makespan_p95_ms);
    println!("  cost_mean={}", summary.cost_mean);
    let dir = config.out_dir.display();
    println!(
        "  outputs: {dir}/workflows.csv, {dir}/tiers.csv, {dir}/summary.csv, {dir}/trace.json"
    );
}
