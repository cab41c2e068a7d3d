// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! E-value verdict aggregation over a set of per-test evidence values.

use testtrack_metadata::Label;

/// One test's accumulated betting evidence.
#[derive(Clone, Debug, PartialEq)]
pub struct TestEvidence {
    /// The test's label.
    pub label: Label,
    /// Green (stability) e-value, `S_i`.
    pub green_value: f64,
    /// Red (flakiness) e-value, `E_i`.
    pub red_value: f64,
    /// High-fidelity reruns this test consumed while accumulating
    /// evidence.
    pub reruns_consumed: u64,
}

/// The aggregate verdict over a set of tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// `Σ E_i` exceeded the red threshold.
    Red,
    /// Every test's `S_i` individually met the green threshold.
    Green,
    /// Neither threshold was met.
    Undecided,
}

/// The full result of [`aggregate`]: the verdict, the weakest test,
/// and the total high-fidelity reruns consumed.
#[derive(Clone, Debug, PartialEq)]
pub struct VerdictReport {
    /// The aggregate verdict.
    pub verdict: Verdict,
    /// The sum of every test's red e-value.
    pub red_total: f64,
    /// The label and green e-value of the weakest (lowest `S_i`) test.
    pub weakest: Option<(Label, f64)>,
    /// Total reruns consumed across all tests.
    pub total_reruns_consumed: u64,
}

/// Thresholds for red/green verdicts, expressed as false-positive
/// rate bounds (`1/alpha_red`, `1/alpha_green`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VerdictThresholds {
    /// False-positive rate bound for the red verdict.
    pub alpha_red: f64,
    /// False-positive rate bound for the green verdict.
    pub alpha_green: f64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            alpha_red: 0.05,
            alpha_green: 0.05,
        }
    }
}

/// Aggregates per-test evidence into one [`VerdictReport`] (spec
/// §4.10): red if the summed red e-values cross `1/alpha_red`, green
/// if every test's green e-value individually meets `1/alpha_green`,
/// undecided otherwise. An empty `evidence` set is reported
/// `Undecided` with no weakest test, since no test has met the green
/// bar to be declared green and there's no evidence to sum to red.
pub fn aggregate(evidence: &[TestEvidence], thresholds: VerdictThresholds) -> VerdictReport {
    let red_threshold = 1.0 / thresholds.alpha_red;
    let green_threshold = 1.0 / thresholds.alpha_green;

    let red_total: f64 = evidence.iter().map(|e| e.red_value).sum();
    let total_reruns_consumed: u64 = evidence.iter().map(|e| e.reruns_consumed).sum();

    let weakest = evidence
        .iter()
        .min_by(|a, b| a.green_value.partial_cmp(&b.green_value).unwrap_or(std::cmp::Ordering::Equal))
        .map(|e| (e.label.clone(), e.green_value));

    let verdict = if red_total >= red_threshold {
        Verdict::Red
    } else if !evidence.is_empty() && evidence.iter().all(|e| e.green_value >= green_threshold) {
        Verdict::Green
    } else {
        Verdict::Undecided
    };

    VerdictReport {
        verdict,
        red_total,
        weakest,
        total_reruns_consumed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn evidence(label: &str, green: f64, red: f64, reruns: u64) -> TestEvidence {
        TestEvidence {
            label: Label::from(label),
            green_value: green,
            red_value: red,
            reruns_consumed: reruns,
        }
    }

    #[test]
    fn red_fires_when_summed_evidence_crosses_threshold() {
        let evidence = vec![evidence("a", 1.0, 15.0, 3), evidence("b", 1.0, 10.0, 2)];
        let report = aggregate(&evidence, VerdictThresholds::default());
        assert_eq!(report.verdict, Verdict::Red);
        assert_eq!(report.red_total, 25.0);
        assert_eq!(report.total_reruns_consumed, 5);
    }

    #[test]
    fn green_requires_every_test_individually_above_threshold() {
        let evidence = vec![evidence("a", 25.0, 0.0, 1), evidence("b", 25.0, 0.0, 1)];
        let report = aggregate(&evidence, VerdictThresholds::default());
        assert_eq!(report.verdict, Verdict::Green);
    }

    #[test]
    fn one_weak_test_prevents_green() {
        let evidence = vec![evidence("a", 25.0, 0.0, 1), evidence("b", 1.0, 0.0, 1)];
        let report = aggregate(&evidence, VerdictThresholds::default());
        assert_eq!(report.verdict, Verdict::Undecided);
        assert_eq!(report.weakest, Some((Label::from("b"), 1.0)));
    }

    #[test]
    fn empty_evidence_is_undecided() {
        let report = aggregate(&[], VerdictThresholds::default());
        assert_eq!(report.verdict, Verdict::Undecided);
        assert!(report.weakest.is_none());
    }
}
