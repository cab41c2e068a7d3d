// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-test lifecycle state machine and post-execution sweep.
//!
//! `transition` is one big match over `(state, trigger)` so every legal
//! edge is exactly one arm; anything not named there is a no-op,
//! logged at `debug!` rather than treated as an error, since an
//! inapplicable trigger (e.g. a `deflake` on a test that's already
//! `burning_in`) is an operator mistake, not a corrupt run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testtrack_metadata::Label;
use testtrack_metadata::status::{HistoryEntry, LifecycleState, StatusFile};
use tracing::debug;

use crate::sprt::{SprtDecision, SprtParams, evaluate, evaluate_reverse};
use crate::status_store::StatusFileOps;

/// The event that can move a test from one lifecycle state to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// `disabled -> new`.
    ReEnable,
    /// `new -> burning_in`.
    BurnIn,
    /// `burning_in -> stable`.
    SprtAcceptH0,
    /// `burning_in -> flaky`.
    SprtRejectH0,
    /// `stable -> flaky` (demotion).
    ReverseSprtRejectH0,
    /// `stable -> burning_in` (demotion inconclusive).
    ReverseSprtInconclusiveAfterFail,
    /// `flaky -> burning_in`.
    Deflake,
    /// `flaky -> disabled`.
    AgeExceedsDeadline,
}

/// The single source of truth for which `(state, trigger)` pairs are
/// legal. Returns `None` for any pair that isn't.
pub fn transition(state: LifecycleState, trigger: Trigger) -> Option<LifecycleState> {
    use LifecycleState::*;
    use Trigger::*;
    match (state, trigger) {
        (Disabled, ReEnable) => Some(New),
        (New, BurnIn) => Some(BurningIn),
        (BurningIn, SprtAcceptH0) => Some(Stable),
        (BurningIn, SprtRejectH0) => Some(Flaky),
        (Stable, ReverseSprtRejectH0) => Some(Flaky),
        (Stable, ReverseSprtInconclusiveAfterFail) => Some(BurningIn),
        (Flaky, Deflake) => Some(BurningIn),
        (Flaky, AgeExceedsDeadline) => Some(Disabled),
        _ => None,
    }
}

fn apply(status: &mut StatusFile, label: &Label, now: DateTime<Utc>, trigger: Trigger) -> bool {
    let Some(current) = status.get(label).map(|e| e.state) else {
        return false;
    };
    match transition(current, trigger) {
        Some(next) => {
            status.upsert(label, now, |entry| entry.state = next);
            true
        }
        None => {
            debug!(%label, ?current, ?trigger, "lifecycle trigger does not apply to current state");
            false
        }
    }
}

/// Explicit `burn-in <label>` subcommand: forces `new -> burning_in`.
pub fn burn_in(status: &mut StatusFile, label: &Label, now: DateTime<Utc>) -> bool {
    status.upsert(label, now, |_| {});
    apply(status, label, now, Trigger::BurnIn)
}

/// Explicit `deflake <label>` subcommand: clears history and
/// `target_hash` in addition to the state transition.
pub fn deflake(status: &mut StatusFile, label: &Label, now: DateTime<Utc>) -> bool {
    let Some(current) = status.get(label).map(|e| e.state) else {
        return false;
    };
    match transition(current, Trigger::Deflake) {
        Some(next) => {
            status.upsert(label, now, |entry| {
                entry.history.clear();
                entry.target_hash = None;
                entry.state = next;
            });
            true
        }
        None => false,
    }
}

/// Re-enables a disabled test: `disabled -> new`.
pub fn re_enable(status: &mut StatusFile, label: &Label, now: DateTime<Utc>) -> bool {
    status.upsert(label, now, |_| {});
    apply(status, label, now, Trigger::ReEnable)
}

/// How many attempts a test effort mode ran, and how to derive the one
/// history entry appended per run: the first attempt's outcome under
/// `converge`, or the overall outcome under `max`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    /// No reruns: dispatch once, diagnostic-style.
    #[default]
    None,
    /// Regression-selected slice, no reruns.
    Regression,
    /// Rerun failures until a decisive per-test SPRT signal or budget
    /// exhaustion.
    Converge,
    /// Rerun every test (pass or fail) until a decisive signal or
    /// budget exhaustion.
    Max,
}

/// One test's attempts from a single run, as produced by the executor.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedTest {
    /// The test's label.
    pub label: Label,
    /// Pass/fail per attempt, in execution order. Always non-empty.
    pub attempts: Vec<bool>,
    /// The commit the test ran against, recorded into history.
    pub commit: String,
    /// The content digest for hash pooling, if supplied.
    pub target_hash: Option<String>,
}

impl ExecutedTest {
    /// The single outcome recorded to history for this run.
    ///
    /// "Overall outcome" for `max` is taken to mean "passed on every
    /// attempt", since `max` reruns every test regardless of its first
    /// result and a single failure among those reruns is exactly the
    /// signal the lifecycle driver exists to catch.
    pub fn history_outcome(&self, effort: Effort) -> bool {
        match effort {
            Effort::Max => self.attempts.iter().all(|&passed| passed),
            Effort::None | Effort::Regression | Effort::Converge => {
                self.attempts.first().copied().unwrap_or(false)
            }
        }
    }
}

/// How a single test's run outcome combines with its SPRT decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Prior failure, SPRT now accepts H0: the test is flaky.
    /// Prior pass, SPRT now rejects H0: also flaky.
    Flake,
    /// Prior pass, SPRT accepts H0: genuinely stable.
    TruePass,
    /// Prior failure, SPRT rejects H0: genuinely broken.
    TrueFail,
    /// No SPRT decision reached within budget.
    Undecided,
}

/// Classifies one test's outcome.
pub fn classify(prior_passed: bool, decision: SprtDecision) -> Classification {
    match (prior_passed, decision) {
        (false, SprtDecision::AcceptH0) => Classification::Flake,
        (false, SprtDecision::RejectH0) => Classification::TrueFail,
        (false, SprtDecision::Continue) => Classification::Undecided,
        (true, SprtDecision::AcceptH0) => Classification::TruePass,
        (true, SprtDecision::RejectH0) => Classification::Flake,
        (true, SprtDecision::Continue) => Classification::Undecided,
    }
}

/// Parameters governing a sweep.
#[derive(Clone, Debug)]
pub struct LifecycleParams {
    /// Forward (burn-in/promotion) SPRT parameters.
    pub sprt: SprtParams,
    /// Reverse (demotion) SPRT parameters; defaults to `sprt` if unset.
    pub demotion_sprt: Option<SprtParams>,
    /// Auto-disable threshold in days since `last_updated`; `None`
    /// disables auto-disable, negative values are treated as disabled
    /// too.
    pub flaky_deadline_days: Option<i64>,
    /// Whether a matching `target_hash` suppresses execution.
    pub skip_unchanged: bool,
    /// The effort mode this run was dispatched under.
    pub effort: Effort,
}

/// Whether a test should be skipped before dispatch due to hash
/// pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashDecision {
    /// Dispatch the test normally.
    Execute,
    /// Skip dispatch and reuse the prior outcome.
    Skip,
}

/// Applies hash-pooling rules for `label` ahead of dispatch. Must be
/// called once per test per run, before the executor decides whether
/// to include it.
pub fn apply_hash_pooling(
    status: &mut StatusFile,
    label: &Label,
    now: DateTime<Utc>,
    target_hash: Option<&str>,
    skip_unchanged: bool,
) -> HashDecision {
    let Some(hash) = target_hash else {
        return HashDecision::Execute;
    };

    if !skip_unchanged {
        status.set_target_hash(label, now, hash.to_string());
        return HashDecision::Execute;
    }

    let entry = status.get(label);
    let stored = entry.and_then(|e| e.target_hash.as_deref());
    let state = entry.map(|e| e.state).unwrap_or(LifecycleState::New);
    let conclusive = matches!(state, LifecycleState::Stable | LifecycleState::Flaky);

    if stored == Some(hash) {
        if conclusive {
            return HashDecision::Skip;
        }
        return HashDecision::Execute;
    }

    if stored.is_some() {
        status.upsert(label, now, |entry| {
            entry.history.clear();
            entry.state = LifecycleState::BurningIn;
        });
    }
    status.set_target_hash(label, now, hash.to_string());
    HashDecision::Execute
}

/// One test's result from running [`sweep`], for reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepRecord {
    /// The test's label.
    pub label: Label,
    /// The lifecycle state it entered the sweep with.
    pub from: LifecycleState,
    /// The lifecycle state it left the sweep with.
    pub to: LifecycleState,
    /// The effort classification reached, if an SPRT was evaluated.
    pub classification: Option<Classification>,
}

/// Runs the post-execution sweep over every test in `executed` (spec
/// §4.6 "Sweep", steps 1-4).
pub fn sweep(
    status: &mut StatusFile,
    executed: &[ExecutedTest],
    now: DateTime<Utc>,
    params: &LifecycleParams,
) -> Vec<SweepRecord> {
    let mut records = Vec::with_capacity(executed.len());

    for test in executed {
        let from = status.get(&test.label).map(|e| e.state).unwrap_or(LifecycleState::New);
        let last_updated_before_sweep = status.get(&test.label).map(|e| e.last_updated);
        let passed = test.history_outcome(params.effort);

        status.append_history(
            &test.label,
            now,
            HistoryEntry {
                passed,
                commit: test.commit.clone(),
                timestamp: now,
            },
        );

        let mut classification = None;

        if from == LifecycleState::BurningIn {
            let history: Vec<bool> = status
                .get(&test.label)
                .map(|e| e.history.iter().map(|h| h.passed).collect())
                .unwrap_or_default();
            let outcome = evaluate(history.iter().copied(), params.sprt);
            classification = Some(classify(passed, outcome.decision));
            match outcome.decision {
                SprtDecision::AcceptH0 => {
                    apply(status, &test.label, now, Trigger::SprtAcceptH0);
                }
                SprtDecision::RejectH0 => {
                    apply(status, &test.label, now, Trigger::SprtRejectH0);
                }
                SprtDecision::Continue => {}
            }
        } else if from == LifecycleState::Stable && !passed {
            let history: Vec<bool> = status
                .get(&test.label)
                .map(|e| e.history.iter().map(|h| h.passed).collect())
                .unwrap_or_default();
            let demotion_params = params.demotion_sprt.unwrap_or(params.sprt);
            let outcome = evaluate_reverse(&history, demotion_params);
            classification = Some(classify(passed, outcome.decision));
            match outcome.decision {
                SprtDecision::RejectH0 => {
                    apply(status, &test.label, now, Trigger::ReverseSprtRejectH0);
                }
                SprtDecision::Continue => {
                    apply(status, &test.label, now, Trigger::ReverseSprtInconclusiveAfterFail);
                }
                SprtDecision::AcceptH0 => {}
            }
        }

        let after_sprt = status.get(&test.label).map(|e| e.state).unwrap_or(from);
        if after_sprt == LifecycleState::Flaky {
            if let Some(deadline) = params.flaky_deadline_days {
                if deadline >= 0 {
                    if let Some(last_updated) = last_updated_before_sweep {
                        let age_days = (now - last_updated).num_days();
                        if age_days >= deadline {
                            apply(status, &test.label, now, Trigger::AgeExceedsDeadline);
                        }
                    }
                }
            }
        }

        let to = status.get(&test.label).map(|e| e.state).unwrap_or(from);
        records.push(SweepRecord {
            label: test.label.clone(),
            from,
            to,
            classification,
        });
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(true, SprtDecision::AcceptH0, Classification::TruePass ; "pass then accept is a true pass")]
    #[test_case(true, SprtDecision::RejectH0, Classification::Flake ; "pass then reject is a flake")]
    #[test_case(true, SprtDecision::Continue, Classification::Undecided ; "pass then continue is undecided")]
    #[test_case(false, SprtDecision::AcceptH0, Classification::Flake ; "fail then accept is a flake")]
    #[test_case(false, SprtDecision::RejectH0, Classification::TrueFail ; "fail then reject is a true fail")]
    #[test_case(false, SprtDecision::Continue, Classification::Undecided ; "fail then continue is undecided")]
    fn classify_matches_effort_table(prior_passed: bool, decision: SprtDecision, expected: Classification) {
        assert_eq!(classify(prior_passed, decision), expected);
    }

    fn executed(label: &str, attempts: &[bool]) -> ExecutedTest {
        ExecutedTest {
            label: Label::from(label),
            attempts: attempts.to_vec(),
            commit: "c1".to_string(),
            target_hash: None,
        }
    }

    fn params() -> LifecycleParams {
        LifecycleParams {
            sprt: SprtParams::default(),
            demotion_sprt: None,
            flaky_deadline_days: None,
            skip_unchanged: true,
            effort: Effort::Converge,
        }
    }

    #[test]
    fn transition_table_matches_diagram() {
        use LifecycleState::*;
        use Trigger::*;
        assert_eq!(transition(Disabled, ReEnable), Some(New));
        assert_eq!(transition(New, BurnIn), Some(BurningIn));
        assert_eq!(transition(BurningIn, SprtAcceptH0), Some(Stable));
        assert_eq!(transition(BurningIn, SprtRejectH0), Some(Flaky));
        assert_eq!(transition(Stable, ReverseSprtRejectH0), Some(Flaky));
        assert_eq!(transition(Stable, ReverseSprtInconclusiveAfterFail), Some(BurningIn));
        assert_eq!(transition(Flaky, Deflake), Some(BurningIn));
        assert_eq!(transition(Flaky, AgeExceedsDeadline), Some(Disabled));
        assert_eq!(transition(New, Deflake), None);
    }

    #[test]
    fn burn_in_moves_new_test_to_burning_in() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        assert!(burn_in(&mut status, &label, now));
        assert_eq!(status.get(&label).unwrap().state, LifecycleState::BurningIn);
    }

    #[test]
    fn sweep_promotes_burning_in_test_after_enough_passes() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        burn_in(&mut status, &label, now);
        for _ in 0..200 {
            sweep(&mut status, &[executed("t1", &[true])], now, &params());
        }
        assert_eq!(status.get(&label).unwrap().state, LifecycleState::Stable);
    }

    #[test]
    fn sweep_demotes_stable_test_after_recent_failures() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        status.upsert(&label, now, |entry| entry.state = LifecycleState::Stable);
        for _ in 0..50 {
            sweep(&mut status, &[executed("t1", &[false])], now, &params());
        }
        assert_eq!(status.get(&label).unwrap().state, LifecycleState::Flaky);
    }

    #[test]
    fn deflake_clears_history_and_hash() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        status.upsert(&label, now, |entry| {
            entry.state = LifecycleState::Flaky;
            entry.target_hash = Some("abc".to_string());
            entry.push_history(HistoryEntry {
                passed: false,
                commit: "c1".to_string(),
                timestamp: now,
            });
        });
        assert!(deflake(&mut status, &label, now));
        let entry = status.get(&label).unwrap();
        assert_eq!(entry.state, LifecycleState::BurningIn);
        assert!(entry.history.is_empty());
        assert!(entry.target_hash.is_none());
    }

    #[test]
    fn hash_pooling_skips_conclusive_unchanged_test() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        status.upsert(&label, now, |entry| {
            entry.state = LifecycleState::Stable;
            entry.target_hash = Some("abc".to_string());
        });
        let decision = apply_hash_pooling(&mut status, &label, now, Some("abc"), true);
        assert_eq!(decision, HashDecision::Skip);
    }

    #[test]
    fn hash_pooling_resets_on_changed_hash() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        status.upsert(&label, now, |entry| {
            entry.state = LifecycleState::Stable;
            entry.target_hash = Some("abc".to_string());
            entry.push_history(HistoryEntry {
                passed: true,
                commit: "c0".to_string(),
                timestamp: now,
            });
        });
        let decision = apply_hash_pooling(&mut status, &label, now, Some("def"), true);
        assert_eq!(decision, HashDecision::Execute);
        let entry = status.get(&label).unwrap();
        assert_eq!(entry.state, LifecycleState::BurningIn);
        assert!(entry.history.is_empty());
        assert_eq!(entry.target_hash.as_deref(), Some("def"));
    }

    #[test]
    fn hash_pooling_without_skip_unchanged_never_suppresses() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let now = Utc::now();
        status.upsert(&label, now, |entry| {
            entry.state = LifecycleState::Stable;
            entry.target_hash = Some("abc".to_string());
        });
        let decision = apply_hash_pooling(&mut status, &label, now, Some("abc"), false);
        assert_eq!(decision, HashDecision::Execute);
    }

    #[test]
    fn flaky_test_auto_disables_after_deadline() {
        let mut status = StatusFile::empty();
        let label = Label::from("t1");
        let old = Utc::now() - chrono::Duration::days(40);
        status.upsert(&label, old, |entry| entry.state = LifecycleState::Flaky);
        let mut p = params();
        p.flaky_deadline_days = Some(30);
        let now = Utc::now();
        sweep(&mut status, &[executed("t1", &[true])], now, &p);
        assert_eq!(status.get(&label).unwrap().state, LifecycleState::Disabled);
    }
}
