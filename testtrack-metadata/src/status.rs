// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The durable status file wire format.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::label::Label;

/// The maximum number of history entries retained per test.
pub const MAX_HISTORY_LEN: usize = 500;

/// A single outcome recorded against a test's rolling history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Whether the test passed on this run.
    pub passed: bool,
    /// The commit the test ran against.
    pub commit: String,
    /// When the run completed.
    pub timestamp: DateTime<Utc>,
}

/// Per-test lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Freshly added, no burn-in has started.
    New,
    /// Accumulating evidence toward a stable/flaky decision.
    BurningIn,
    /// SPRT has accepted H0 (true pass rate is high).
    Stable,
    /// SPRT has rejected H0 (test is intermittent).
    Flaky,
    /// Excluded from all dispatch.
    Disabled,
}

impl LifecycleState {
    /// All state names, for error messages and CLI help text.
    pub fn variants() -> &'static [&'static str] {
        &["new", "burning_in", "stable", "flaky", "disabled"]
    }
}

/// Per-test durable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Bounded FIFO of up to [`MAX_HISTORY_LEN`] outcomes, oldest first.
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    /// When this entry was last mutated.
    pub last_updated: DateTime<Utc>,
    /// Opaque content digest of the test's last-seen inputs, used for
    /// hash pooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<String>,
}

impl StatusEntry {
    /// A fresh entry in the `new` state, as created the first time a
    /// label is seen.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: LifecycleState::New,
            history: VecDeque::new(),
            last_updated: now,
            target_hash: None,
        }
    }

    /// Appends a history entry, enforcing the bounded-FIFO invariant.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > MAX_HISTORY_LEN {
            self.history.pop_front();
        }
    }
}

/// The status file: a map from label to durable per-test state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFile {
    /// All known tests' status entries.
    #[serde(default)]
    pub tests: IndexMap<Label, StatusEntry>,
}

impl StatusFile {
    /// An empty status file, as used when no file exists yet.
    pub fn empty() -> Self {
        Self::default()
    }
}
