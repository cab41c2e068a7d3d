// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs test child processes under a concurrency gate.
//!
//! Keeps a clean split between an executor that knows nothing but how
//! to run one unit of work, and a dispatcher that owns scheduling: the
//! executor itself does not communicate directly with the outside
//! world -- all communication here is one-directional,
//! [`ExecutorEvent`]s over an `UnboundedSender`, consumed by whatever
//! owns the run (the CLI's `run` subcommand, or a test harness).
//! Reading a child's stdout/stderr and awaiting its exit status happen
//! on the same task, preserving structured-log-vs-exit ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use testtrack_metadata::Label;
use testtrack_metadata::log_event::StructuredLog;
use testtrack_metadata::manifest::{Manifest, TestNode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use crate::dag::Dag;
use crate::errors::TestFailureKind;
use crate::lifecycle::Effort;
use crate::log_parser::LogParser;
use crate::sprt::{SprtDecision, SprtParams, evaluate};

/// Which dispatch order and gating rules govern a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Topological order, dependency gating, no early stop.
    Diagnostic,
    /// BFS-from-roots order, early stop on `max_failures`, no
    /// dependency gating.
    Detection,
}

/// One test's final outcome for a run.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Exit code 0.
    Passed,
    /// Non-zero exit, crash, timeout, or cancellation.
    Failed(TestFailureKind),
    /// Passed, but a same-run dependency finished `failed` afterward
    /// (diagnostic mode only).
    PassedWithDepsFailed,
    /// Failed, and a same-run dependency also finished `failed`
    /// (diagnostic mode only).
    FailedWithDepsFailed,
    /// Never spawned because a prerequisite already failed
    /// (diagnostic mode only).
    DependenciesFailed,
    /// Never spawned: either detection mode's early stop fired, or the
    /// run was cancelled before dispatch.
    Skipped,
}

impl Outcome {
    /// Whether this outcome counts as a pass for dependency gating:
    /// a dependency is satisfied once it finished `passed`.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Outcome::Passed | Outcome::PassedWithDepsFailed)
    }

    /// Whether this outcome counts as a failure for detection mode's
    /// early-stop counter and cascading.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::FailedWithDepsFailed)
    }
}

/// The full result of running one test.
#[derive(Clone, Debug, PartialEq)]
pub struct TestResult {
    /// The test's label.
    pub label: Label,
    /// Final outcome.
    pub outcome: Outcome,
    /// Every attempt, in order. Reruns of a single test are sequential,
    /// never concurrent with each other.
    pub attempts: Vec<AttemptRecord>,
}

/// The full record of one attempt at running a test.
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptRecord {
    /// Exit code 0 and no interruption.
    pub passed: bool,
    /// Why the attempt failed, if it did.
    pub failure: Option<TestFailureKind>,
    /// The child's exit code, when it ran to a normal exit.
    pub exit_code: Option<i32>,
    /// Captured stdout, verbatim -- the lines `LogParser` passed
    /// through untouched, rejoined with newlines.
    pub stdout: String,
    /// Captured stderr, verbatim.
    pub stderr: String,
    /// Parsed structured log.
    pub structured_log: StructuredLog,
    /// When the child was spawned.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal state.
    pub finished_at: DateTime<Utc>,
}

/// Progress notifications emitted during a run. The executor itself
/// does not communicate directly with the outside world; this is the
/// only channel it speaks through.
#[derive(Clone, Debug)]
pub enum ExecutorEvent {
    /// A test was just spawned.
    Dispatched {
        /// The dispatched test's label.
        label: Label,
    },
    /// A test finished (after all its reruns).
    Completed {
        /// The completed test's label.
        label: Label,
        /// Its final outcome.
        outcome: Outcome,
    },
    /// Every test in the run has reached a terminal outcome.
    RunFinished,
}

/// Parameters governing one run.
#[derive(Clone, Debug)]
pub struct ExecutorParams {
    /// Dispatch order and gating rules.
    pub mode: Mode,
    /// Concurrency cap on simultaneously in-flight tests.
    pub concurrency: usize,
    /// Detection-mode early-stop threshold.
    pub max_failures: u32,
    /// Effort mode governing reruns.
    pub effort: Effort,
    /// Per-test rerun budget under `converge`/`max`.
    pub max_reruns: u32,
    /// SPRT parameters used to decide when reruns stop early.
    pub sprt: SprtParams,
    /// SIGTERM-to-SIGKILL grace period when a run is cancelled.
    pub grace_period: Duration,
    /// Optional per-test wallclock timeout.
    pub timeout: Option<Duration>,
}

/// Sends SIGTERM (unix) or an immediate kill (elsewhere), then races a
/// grace period against the child actually exiting, falling back to
/// SIGKILL.
async fn terminate_then_kill(child: &mut tokio::process::Child, grace_period: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let grace = tokio::time::sleep(grace_period);
    tokio::pin!(grace);
    tokio::select! {
        _ = child.wait() => {}
        _ = &mut grace => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Why a single attempt stopped short of a normal exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    TimedOut,
}

/// Spawns `node`'s executable and runs it to completion, racing
/// cancellation and an optional timeout against the child's own exit.
#[instrument(skip(node, cancel), fields(executable = %node.executable))]
async fn run_attempt(
    node: &TestNode,
    grace_period: Duration,
    timeout: Option<Duration>,
    mut cancel: watch::Receiver<bool>,
) -> AttemptRecord {
    let started_at = Utc::now();
    let mut command = Command::new(node.executable.as_str());
    for (key, value) in &node.parameters {
        command.env(key, value.to_string());
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return AttemptRecord {
                passed: false,
                failure: Some(TestFailureKind::SpawnError(err.to_string())),
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                structured_log: StructuredLog::default(),
                started_at,
                finished_at: Utc::now(),
            };
        }
    };

    let stdout = child.stdout.take().expect("stdout piped above");
    let mut stderr = child.stderr.take().expect("stderr piped above");

    let run_to_completion = async {
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = LogParser::new();
        let mut stderr_buf = Vec::new();
        let stdout_fut = async {
            while let Ok(Some(line)) = lines.next_line().await {
                parser.parse_line(&line);
            }
        };
        let stderr_fut = stderr.read_to_end(&mut stderr_buf);
        let (_, _) = tokio::join!(stdout_fut, stderr_fut);
        let status = child.wait().await;
        (status, parser, stderr_buf, child)
    };
    tokio::pin!(run_to_completion);

    let cancel_signalled = async {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    };

    let timed_out = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timed_out);

    let interruption = tokio::select! {
        biased;
        (status, parser, stderr_buf, _child) = &mut run_to_completion => {
            let (log, passthrough) = parser.finish();
            let stdout_text = passthrough.join("\n");
            let stderr_text = String::from_utf8_lossy(&stderr_buf).into_owned();
            let finished_at = Utc::now();
            return match status {
                Ok(status) if status.success() => AttemptRecord {
                    passed: true,
                    failure: None,
                    exit_code: status.code(),
                    stdout: stdout_text,
                    stderr: stderr_text,
                    structured_log: log,
                    started_at,
                    finished_at,
                },
                Ok(status) => AttemptRecord {
                    passed: false,
                    failure: Some(
                        status
                            .code()
                            .map(TestFailureKind::NonZeroExit)
                            .unwrap_or_else(|| TestFailureKind::Crashed("terminated by signal".to_string())),
                    ),
                    exit_code: status.code(),
                    stdout: stdout_text,
                    stderr: stderr_text,
                    structured_log: log,
                    started_at,
                    finished_at,
                },
                Err(err) => AttemptRecord {
                    passed: false,
                    failure: Some(TestFailureKind::Crashed(err.to_string())),
                    exit_code: None,
                    stdout: stdout_text,
                    stderr: stderr_text,
                    structured_log: log,
                    started_at,
                    finished_at,
                },
            };
        }
        _ = cancel_signalled => Interruption::Cancelled,
        _ = &mut timed_out => Interruption::TimedOut,
    };

    // Interrupted: `run_to_completion` is still pending and holds the
    // only handle to the child, so drop it to regain ownership, signal
    // the process, and reap it without further log collection -- a
    // synthetic failure is reported either way.
    drop(run_to_completion);
    terminate_then_kill(&mut child, grace_period).await;
    let failure = match interruption {
        Interruption::Cancelled => TestFailureKind::Cancelled,
        Interruption::TimedOut => TestFailureKind::Timeout,
    };
    AttemptRecord {
        passed: false,
        failure: Some(failure),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        structured_log: StructuredLog::default(),
        started_at,
        finished_at: Utc::now(),
    }
}

/// Runs `node` under `params.effort`'s rerun policy, stopping reruns
/// early once an in-run SPRT over the accumulated attempts decides, or
/// `max_reruns` is exhausted.
async fn run_with_retries(node: &TestNode, params: &ExecutorParams, cancel: watch::Receiver<bool>) -> Vec<AttemptRecord> {
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    loop {
        let record = run_attempt(node, params.grace_period, params.timeout, cancel.clone()).await;
        let passed = record.passed;
        attempts.push(record);

        if *cancel.borrow() {
            break;
        }

        let should_rerun = match params.effort {
            Effort::None | Effort::Regression => false,
            Effort::Converge => !passed,
            Effort::Max => true,
        };
        if !should_rerun || attempts.len() as u32 >= params.max_reruns {
            break;
        }
        let sprt = evaluate(attempts.iter().map(|attempt| attempt.passed), params.sprt);
        if sprt.decision != SprtDecision::Continue {
            break;
        }
    }

    attempts
}

/// Every test reachable from `failed` that is still in scope, used to
/// cascade `DependenciesFailed` to its descendants transitively.
fn cascade_dependencies_failed(dag: &Dag, failed: &Label, scope: &BTreeSet<Label>) -> BTreeSet<Label> {
    dag.descendants(failed)
        .into_iter()
        .filter(|label| scope.contains(label))
        .collect()
}

fn skip_remaining(pending: Vec<Label>, results: &mut BTreeMap<Label, TestResult>) {
    for label in pending {
        results.insert(
            label.clone(),
            TestResult {
                label,
                outcome: Outcome::Skipped,
                attempts: vec![],
            },
        );
    }
}

type AttemptOutcome = (Label, Vec<AttemptRecord>);

/// Runs `nodes` from `manifest` under `params`, returning every test's
/// final result. `cancel` is a watch channel the caller flips to
/// `true` to request graceful shutdown.
pub async fn run(
    dag: &Dag,
    manifest: &Manifest,
    nodes: &BTreeSet<Label>,
    params: ExecutorParams,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
) -> BTreeMap<Label, TestResult> {
    let semaphore = std::sync::Arc::new(Semaphore::new(params.concurrency.max(1)));
    let mut results: BTreeMap<Label, TestResult> = BTreeMap::new();
    let mut dependencies_failed: BTreeSet<Label> = BTreeSet::new();
    let mut failed_count: u32 = 0;
    let mut early_stopped = false;

    let mut pending: Vec<Label> = match params.mode {
        Mode::Diagnostic => dag.topological(nodes),
        Mode::Detection => dag.bfs_from_roots(nodes),
    };
    let mut in_flight: JoinSet<AttemptOutcome> = JoinSet::new();

    while !pending.is_empty() || !in_flight.is_empty() {
        if early_stopped {
            skip_remaining(std::mem::take(&mut pending), &mut results);
            if in_flight.is_empty() {
                break;
            }
        }

        let mut still_pending = Vec::new();
        for label in pending.drain(..) {
            let Some(node) = manifest.test_set_tests.get(&label) else {
                still_pending.push(label);
                continue;
            };

            if params.mode == Mode::Diagnostic {
                let blocked = node.depends_on.iter().any(|dep| {
                    dependencies_failed.contains(dep)
                        || results.get(dep).is_some_and(|r| !r.outcome.satisfies_dependency())
                });
                if blocked {
                    dependencies_failed.insert(label.clone());
                    for descendant in cascade_dependencies_failed(dag, &label, nodes) {
                        dependencies_failed.insert(descendant);
                    }
                    results.insert(
                        label.clone(),
                        TestResult {
                            label,
                            outcome: Outcome::DependenciesFailed,
                            attempts: vec![],
                        },
                    );
                    continue;
                }
                let unready = node
                    .depends_on
                    .iter()
                    .any(|dep| nodes.contains(dep) && !results.contains_key(dep));
                if unready {
                    still_pending.push(label);
                    continue;
                }
            }

            let node = node.clone();
            let semaphore = semaphore.clone();
            let params = params.clone();
            let cancel_rx = cancel.clone();
            let events_tx = events.clone();
            let dispatch_label = label.clone();
            in_flight.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let _ = events_tx.send(ExecutorEvent::Dispatched {
                    label: dispatch_label.clone(),
                });
                let attempts = run_with_retries(&node, &params, cancel_rx).await;
                (dispatch_label, attempts)
            });
        }
        pending = still_pending;

        if in_flight.is_empty() {
            if pending.is_empty() {
                break;
            }
            // Nothing runnable yet but tests remain: every remaining
            // dependency must already be in `results`, or this would
            // be a cycle -- which `Dag::build` already rejects
            // upstream.
            debug!(remaining = pending.len(), "no runnable test this pass, waiting on dependencies");
            continue;
        }

        if let Some(joined) = in_flight.join_next().await {
            let (label, attempts) = joined.unwrap_or_else(|err| {
                let now = Utc::now();
                (
                    Label::from("<unknown>"),
                    vec![AttemptRecord {
                        passed: false,
                        failure: Some(TestFailureKind::Crashed(format!("executor task panicked: {err}"))),
                        exit_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        structured_log: StructuredLog::default(),
                        started_at: now,
                        finished_at: now,
                    }],
                )
            });
            let failure = attempts.last().and_then(|attempt| attempt.failure.clone());
            let passed = failure.is_none();
            // Combined outcomes are a diagnostic-mode-only concept;
            // detection mode reports only passed/failed/skipped. Gate
            // both the read and the cascade on mode so a same-run
            // failure can never taint a detection-mode result.
            let had_dep_failure = params.mode == Mode::Diagnostic && dependencies_failed.contains(&label);
            let outcome = match (passed, had_dep_failure) {
                (true, false) => Outcome::Passed,
                (true, true) => Outcome::PassedWithDepsFailed,
                (false, false) => Outcome::Failed(failure.expect("failure present when not passed")),
                (false, true) => Outcome::FailedWithDepsFailed,
            };
            if outcome.is_failure() {
                failed_count += 1;
                if params.mode == Mode::Diagnostic {
                    for descendant in cascade_dependencies_failed(dag, &label, nodes) {
                        dependencies_failed.insert(descendant);
                    }
                }
            }
            let _ = events.send(ExecutorEvent::Completed {
                label: label.clone(),
                outcome: outcome.clone(),
            });
            results.insert(label.clone(), TestResult { label, outcome, attempts });

            if params.mode == Mode::Detection && failed_count >= params.max_failures {
                debug!(failed_count, max_failures = params.max_failures, "early stop threshold reached");
                early_stopped = true;
            }
        }
    }

    let _ = events.send(ExecutorEvent::RunFinished);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use testtrack_metadata::manifest::TestSetNode;

    fn node(executable: &str, deps: &[&str]) -> TestNode {
        TestNode {
            assertion: String::new(),
            executable: executable.into(),
            depends_on: deps.iter().map(|s| Label::from(*s)).collect(),
            requirement_id: None,
            judgement_executable: None,
            disabled: false,
            parameters: IndexMap::new(),
        }
    }

    fn manifest_with(nodes: &[(&str, &str, &[&str])]) -> Manifest {
        let mut tests = IndexMap::new();
        for (label, executable, deps) in nodes {
            tests.insert(Label::from(*label), node(executable, deps));
        }
        Manifest {
            test_set: TestSetNode {
                name: "root".to_string(),
                assertion: String::new(),
                requirement_id: None,
                tests: tests.keys().cloned().collect(),
                subsets: vec![],
            },
            test_set_tests: tests,
        }
    }

    #[test]
    fn outcome_satisfies_dependency_only_for_passing_variants() {
        assert!(Outcome::Passed.satisfies_dependency());
        assert!(Outcome::PassedWithDepsFailed.satisfies_dependency());
        assert!(!Outcome::Failed(TestFailureKind::Timeout).satisfies_dependency());
        assert!(!Outcome::DependenciesFailed.satisfies_dependency());
        assert!(!Outcome::Skipped.satisfies_dependency());
    }

    #[test]
    fn outcome_is_failure_covers_both_failed_variants() {
        assert!(Outcome::Failed(TestFailureKind::Timeout).is_failure());
        assert!(Outcome::FailedWithDepsFailed.is_failure());
        assert!(!Outcome::Passed.is_failure());
        assert!(!Outcome::DependenciesFailed.is_failure());
    }

    #[test]
    fn cascade_dependencies_failed_is_limited_to_scope() {
        let manifest = manifest_with(&[
            ("a", "bin/a", &[]),
            ("b", "bin/b", &["a"]),
            ("c", "bin/c", &["b"]),
        ]);
        let dag = Dag::build(&manifest).unwrap();
        let scope: BTreeSet<Label> = BTreeSet::from([Label::from("a"), Label::from("b")]);
        let cascaded = cascade_dependencies_failed(&dag, &Label::from("a"), &scope);
        assert_eq!(cascaded, BTreeSet::from([Label::from("b")]));
    }

    #[tokio::test]
    async fn run_reports_spawn_error_for_missing_executable() {
        let manifest = manifest_with(&[("a", "/no/such/executable-testtrack", &[])]);
        let dag = Dag::build(&manifest).unwrap();
        let nodes = BTreeSet::from([Label::from("a")]);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let params = ExecutorParams {
            mode: Mode::Diagnostic,
            concurrency: 1,
            max_failures: 1,
            effort: Effort::None,
            max_reruns: 100,
            sprt: SprtParams::default(),
            grace_period: Duration::from_millis(50),
            timeout: None,
        };
        let results = run(&dag, &manifest, &nodes, params, cancel_rx, events_tx).await;
        drop(cancel_tx);

        let result = results.get(&Label::from("a")).unwrap();
        assert!(matches!(result.outcome, Outcome::Failed(TestFailureKind::SpawnError(_))));

        let mut saw_dispatched = false;
        let mut saw_finished = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                ExecutorEvent::Dispatched { .. } => saw_dispatched = true,
                ExecutorEvent::RunFinished => {
                    saw_finished = true;
                    break;
                }
                ExecutorEvent::Completed { .. } => {}
            }
        }
        assert!(saw_dispatched);
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn dependent_of_failed_test_is_never_dispatched() {
        let manifest = manifest_with(&[
            ("a", "/no/such/executable-testtrack", &[]),
            ("b", "/no/such/executable-testtrack", &["a"]),
        ]);
        let dag = Dag::build(&manifest).unwrap();
        let nodes = BTreeSet::from([Label::from("a"), Label::from("b")]);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let params = ExecutorParams {
            mode: Mode::Diagnostic,
            concurrency: 2,
            max_failures: 10,
            effort: Effort::None,
            max_reruns: 100,
            sprt: SprtParams::default(),
            grace_period: Duration::from_millis(50),
            timeout: None,
        };
        let results = run(&dag, &manifest, &nodes, params, cancel_rx, events_tx).await;

        assert!(matches!(
            results.get(&Label::from("a")).unwrap().outcome,
            Outcome::Failed(TestFailureKind::SpawnError(_))
        ));
        assert_eq!(results.get(&Label::from("b")).unwrap().outcome, Outcome::DependenciesFailed);
    }
}
