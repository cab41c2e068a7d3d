// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `testtrack`: a thin CLI shell over `testtrack-core`.
//!
//! Argument parsing is deliberately minimal: CLI surface and flag
//! parsing, and report rendering, are treated as external concerns.
//! This binary exists only so the core has a runnable entry point,
//! keeping it a thin shell over the orchestration logic it wraps.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use testtrack_core::config::OrchestratorConfig;
use testtrack_core::cooccurrence::{self, ClassificationRules, GitCommitSource};
use testtrack_core::dag::Dag;
use testtrack_core::executor::{self, ExecutorEvent, ExecutorParams, Mode, Outcome};
use testtrack_core::lifecycle::{self, Classification, Effort, ExecutedTest, LifecycleParams};
use testtrack_core::regression_selector::{self, SelectableTest, SelectorParams};
use testtrack_core::status_store;
use testtrack_metadata::Label;
use testtrack_metadata::manifest::Manifest;
use testtrack_metadata::status::LifecycleState;
use tracing::info;

/// Process exit codes used by every subcommand.
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const INVALID: i32 = 2;
}

#[derive(Debug, Parser)]
#[command(name = "testtrack", about = "Test orchestration core: run, select, and track test health.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tests from a manifest, gated by dependencies and effort mode.
    Run(RunArgs),
    /// Print the dispatch order for a manifest without running anything.
    List(ManifestArgs),
    /// Select a regression slice from a set of changed files.
    Select(SelectArgs),
    /// Build or incrementally update the co-occurrence graph from VCS history.
    GraphBuild(GraphBuildArgs),
    /// Move a test from `new` into `burning_in`.
    BurnIn(LabelArgs),
    /// Move a flaky test back into `burning_in`, clearing its history.
    Deflake(LabelArgs),
    /// Re-enable a disabled test, moving it back to `new`.
    ReEnable(LabelArgs),
}

#[derive(Debug, Clone, clap::Args)]
struct ManifestArgs {
    /// Path to the manifest JSON file.
    #[arg(long)]
    manifest: Utf8PathBuf,
}

#[derive(Debug, Clone, clap::Args)]
struct StatusArgs {
    /// Path to the durable status file.
    #[arg(long, default_value = "testtrack-status.json")]
    status: Utf8PathBuf,
}

#[derive(Debug, Clone, clap::Args)]
struct LabelArgs {
    #[command(flatten)]
    status: StatusArgs,
    /// The test's label.
    label: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Diagnostic,
    Detection,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EffortArg {
    None,
    Regression,
    Converge,
    Max,
}

impl From<EffortArg> for Effort {
    fn from(value: EffortArg) -> Self {
        match value {
            EffortArg::None => Effort::None,
            EffortArg::Regression => Effort::Regression,
            EffortArg::Converge => Effort::Converge,
            EffortArg::Max => Effort::Max,
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
struct RunArgs {
    #[command(flatten)]
    manifest: ManifestArgs,
    #[command(flatten)]
    status: StatusArgs,
    /// Optional TOML configuration file layered under the built-in defaults.
    #[arg(long)]
    config: Option<Utf8PathBuf>,
    /// Dispatch order and gating rules.
    #[arg(long, value_enum, default_value_t = ModeArg::Diagnostic)]
    mode: ModeArg,
    /// Rerun policy applied to failing attempts.
    #[arg(long, value_enum)]
    effort: Option<EffortArg>,
    /// Detection-mode early-stop threshold.
    #[arg(long)]
    max_failures: Option<u32>,
    /// Concurrency cap; defaults to host parallelism.
    #[arg(long)]
    concurrency: Option<usize>,
    /// The commit identifier recorded into each executed test's history entry.
    #[arg(long, default_value = "unknown")]
    commit: String,
    /// A `label=hash` content digest for hash pooling (repeatable). A test
    /// whose supplied hash matches its stored one and whose state is
    /// conclusive is skipped and its prior outcome is reused.
    #[arg(long = "target-hash")]
    target_hash: Vec<String>,
    /// Print the dispatch order and exit without spawning anything.
    #[arg(long)]
    dry_run: bool,
}

fn parse_target_hashes(raw: &[String]) -> std::collections::BTreeMap<Label, String> {
    raw.iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(label, hash)| (Label::from(label), hash.to_string()))
        .collect()
}

#[derive(Debug, Clone, clap::Args)]
struct SelectArgs {
    #[command(flatten)]
    manifest: ManifestArgs,
    #[command(flatten)]
    status: StatusArgs,
    /// Path to the co-occurrence graph.
    #[arg(long, default_value = "testtrack-graph.json")]
    graph: Utf8PathBuf,
    /// Changed file paths (repeatable).
    #[arg(long = "changed", required = true)]
    changed_files: Vec<String>,
    /// Fraction of stable candidates to select before dependency closure.
    #[arg(long)]
    max_test_percentage: Option<f64>,
    /// Maximum BFS hop distance scored from a changed file.
    #[arg(long)]
    max_hops: Option<u32>,
}

#[derive(Debug, Clone, clap::Args)]
struct GraphBuildArgs {
    /// Repository root to read commit history from.
    #[arg(long, default_value = ".")]
    repo: Utf8PathBuf,
    /// Path to the co-occurrence graph.
    #[arg(long, default_value = "testtrack-graph.json")]
    graph: Utf8PathBuf,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to start async runtime")?
        .block_on(dispatch(cli.command))?;
    std::process::exit(code);
}

async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => run(args).await,
        Command::List(args) => list(args),
        Command::Select(args) => select(args),
        Command::GraphBuild(args) => graph_build(args),
        Command::BurnIn(args) => burn_in(args),
        Command::Deflake(args) => deflake(args),
        Command::ReEnable(args) => re_enable(args),
    }
}

fn load_manifest(path: &camino::Utf8Path) -> Result<Option<Manifest>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("invalid manifest at `{path}`: {err}");
            return Ok(None);
        }
    };
    match Manifest::from_json(&text) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(err) => {
            eprintln!("invalid manifest at `{path}`: {err}");
            Ok(None)
        }
    }
}

fn build_dag(manifest: &Manifest) -> Result<Option<Dag>> {
    match Dag::build(manifest) {
        Ok(dag) => Ok(Some(dag)),
        Err(err) => {
            eprintln!("{err}");
            Ok(None)
        }
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let Some(manifest) = load_manifest(&args.manifest.manifest)? else {
        return Ok(exit_code::INVALID);
    };
    let Some(dag) = build_dag(&manifest)? else {
        return Ok(exit_code::INVALID);
    };

    let mut config = OrchestratorConfig::load(args.config.as_deref()).wrap_err("failed to load config")?;
    if let Some(effort) = args.effort {
        config.effort = effort.into();
    }
    if let Some(max_failures) = args.max_failures {
        config.max_failures = max_failures;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }

    let mut status = status_store::load(&args.status.status);
    let mode = match args.mode {
        ModeArg::Diagnostic => Mode::Diagnostic,
        ModeArg::Detection => Mode::Detection,
    };

    let pooling_checked_at = Utc::now();
    let target_hashes = parse_target_hashes(&args.target_hash);
    let mut hash_pooled_skips: BTreeSet<Label> = BTreeSet::new();
    for (label, hash) in &target_hashes {
        let decision = lifecycle::apply_hash_pooling(
            &mut status,
            label,
            pooling_checked_at,
            Some(hash.as_str()),
            config.skip_unchanged,
        );
        if decision == lifecycle::HashDecision::Skip {
            hash_pooled_skips.insert(label.clone());
        }
    }

    let enabled: BTreeSet<Label> = manifest
        .enabled_tests()
        .filter(|label| !hash_pooled_skips.contains(*label))
        .cloned()
        .collect();
    let nodes: BTreeSet<Label> = match mode {
        Mode::Diagnostic => enabled,
        // Detection mode and regression selection only consider tests
        // whose current state is `stable`.
        Mode::Detection => enabled
            .into_iter()
            .filter(|label| {
                status
                    .tests
                    .get(label)
                    .is_some_and(|entry| entry.state == LifecycleState::Stable)
            })
            .collect(),
    };

    if args.dry_run {
        let order = match mode {
            Mode::Diagnostic => dag.topological(&nodes),
            Mode::Detection => dag.bfs_from_roots(&nodes),
        };
        for label in order {
            println!("{label}");
        }
        return Ok(exit_code::SUCCESS);
    }

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let ctrl_c = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    };
    tokio::spawn(ctrl_c);

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ExecutorEvent::Dispatched { label } => info!(%label, "dispatched"),
                ExecutorEvent::Completed { label, outcome } => info!(%label, ?outcome, "completed"),
                ExecutorEvent::RunFinished => break,
            }
        }
    });

    let params = ExecutorParams {
        mode,
        concurrency: config.concurrency,
        max_failures: config.max_failures,
        effort: config.effort,
        max_reruns: config.max_reruns,
        sprt: config.sprt,
        grace_period: config.grace_period,
        timeout: config.timeout,
    };
    let results = executor::run(&dag, &manifest, &nodes, params, cancel_rx, events_tx).await;
    let _ = printer.await;

    let now = Utc::now();
    let executed: Vec<ExecutedTest> = results
        .values()
        .filter(|result| !result.attempts.is_empty())
        .map(|result| ExecutedTest {
            label: result.label.clone(),
            attempts: result.attempts.iter().map(|attempt| attempt.passed).collect(),
            commit: args.commit.clone(),
            target_hash: target_hashes.get(&result.label).cloned(),
        })
        .collect();

    let lifecycle_params = LifecycleParams {
        sprt: config.sprt,
        demotion_sprt: config.demotion_sprt,
        flaky_deadline_days: config.flaky_deadline_days,
        skip_unchanged: config.skip_unchanged,
        effort: config.effort,
    };
    let sweep_records = lifecycle::sweep(&mut status, &executed, now, &lifecycle_params);
    status_store::save(&args.status.status, &status).wrap_err("failed to save status file")?;

    let mut any_failure = false;
    for label in &hash_pooled_skips {
        let reused_pass = status
            .tests
            .get(label)
            .and_then(|entry| entry.history.back())
            .map(|entry| entry.passed)
            .unwrap_or(true);
        println!("{label}: skipped (hash pooling, reusing prior {})", if reused_pass { "pass" } else { "fail" });
        any_failure |= !reused_pass;
    }
    for (label, result) in &results {
        println!("{label}: {:?}", result.outcome);
        if result.outcome.is_failure() || matches!(result.outcome, Outcome::DependenciesFailed) {
            any_failure = true;
        }
    }
    for record in &sweep_records {
        if record.to == LifecycleState::Flaky || matches!(record.classification, Some(Classification::Flake)) {
            println!("{}: lifecycle {:?} -> {:?}", record.label, record.from, record.to);
            any_failure = true;
        }
    }

    Ok(if any_failure { exit_code::FAILURE } else { exit_code::SUCCESS })
}

fn list(args: ManifestArgs) -> Result<i32> {
    let Some(manifest) = load_manifest(&args.manifest)? else {
        return Ok(exit_code::INVALID);
    };
    let Some(dag) = build_dag(&manifest)? else {
        return Ok(exit_code::INVALID);
    };
    for label in dag.topological(dag.nodes()) {
        println!("{label}");
    }
    Ok(exit_code::SUCCESS)
}

fn select(args: SelectArgs) -> Result<i32> {
    let Some(manifest) = load_manifest(&args.manifest.manifest)? else {
        return Ok(exit_code::INVALID);
    };
    let Some(dag) = build_dag(&manifest)? else {
        return Ok(exit_code::INVALID);
    };
    let status = status_store::load(&args.status.status);
    let rules = ClassificationRules::defaults();
    let graph = cooccurrence::load(&args.graph, &rules);

    let all_tests: Vec<SelectableTest> = manifest
        .test_set_tests
        .iter()
        .map(|(label, node)| SelectableTest {
            label: label.clone(),
            executable: node.executable.to_string(),
        })
        .collect();

    let defaults = SelectorParams::default();
    let params = SelectorParams {
        max_test_percentage: args.max_test_percentage.unwrap_or(defaults.max_test_percentage),
        max_hops: args.max_hops.unwrap_or(defaults.max_hops),
    };

    let changed: BTreeSet<String> = args.changed_files.into_iter().collect();
    let report = regression_selector::select(&graph, &status, &dag, &all_tests, changed, params);

    println!(
        "selected {} of {} stable candidates (fallback: {:?})",
        report.selected.len(),
        report.total_stable_tests,
        report.fallback_used
    );
    for label in &report.selected {
        let score = report.scores.get(label).copied().unwrap_or(0.0);
        println!("{label}\t{score:.4}");
    }
    Ok(exit_code::SUCCESS)
}

fn graph_build(args: GraphBuildArgs) -> Result<i32> {
    let rules = ClassificationRules::defaults();
    let existing = cooccurrence::load(&args.graph, &rules);
    let source = GitCommitSource {
        repo_root: args.repo,
    };
    let built = match cooccurrence::build(&source, existing, &rules) {
        Ok(graph) => graph,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit_code::INVALID);
        }
    };
    println!(
        "analyzed {} commits (last: {})",
        built.metadata.total_commits_analyzed,
        built.metadata.last_commit.as_deref().unwrap_or("<none>")
    );
    cooccurrence::save(&args.graph, &built).wrap_err("failed to save co-occurrence graph")?;
    Ok(exit_code::SUCCESS)
}

fn burn_in(args: LabelArgs) -> Result<i32> {
    let mut status = status_store::load(&args.status.status);
    let label = Label::from(args.label.as_str());
    let now = Utc::now();
    if !lifecycle::burn_in(&mut status, &label, now) {
        eprintln!("`{label}` cannot move to burning_in from its current state");
        return Ok(exit_code::INVALID);
    }
    status_store::save(&args.status.status, &status).wrap_err("failed to save status file")?;
    Ok(exit_code::SUCCESS)
}

fn deflake(args: LabelArgs) -> Result<i32> {
    let mut status = status_store::load(&args.status.status);
    let label = Label::from(args.label.as_str());
    let now = Utc::now();
    if !lifecycle::deflake(&mut status, &label, now) {
        eprintln!("`{label}` cannot be deflaked from its current state");
        return Ok(exit_code::INVALID);
    }
    status_store::save(&args.status.status, &status).wrap_err("failed to save status file")?;
    Ok(exit_code::SUCCESS)
}

fn re_enable(args: LabelArgs) -> Result<i32> {
    let mut status = status_store::load(&args.status.status);
    let label = Label::from(args.label.as_str());
    let now = Utc::now();
    if !lifecycle::re_enable(&mut status, &label, now) {
        eprintln!("`{label}` cannot be re-enabled from its current state");
        return Ok(exit_code::INVALID);
    }
    status_store::save(&args.status.status, &status).wrap_err("failed to save status file")?;
    Ok(exit_code::SUCCESS)
}
