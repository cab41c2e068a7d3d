// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `[TST]` structured-log wire format and the parsed block/step
//! tree it is folded into.

use serde::{Deserialize, Serialize};

/// The sentinel token that precedes a structured-log JSON payload on a
/// line of child stdout.
pub const SENTINEL: &str = "[TST]";

/// One `[TST]` event, as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEvent {
    /// Opens a new block frame. Must appear at top level.
    BlockStart {
        /// The block's name.
        block: String,
    },
    /// Closes the innermost block frame.
    BlockEnd {
        /// Must match the name of the block being closed.
        block: String,
    },
    /// Opens a new step frame under the current block or step.
    StepStart {
        /// The step's name.
        step: String,
        /// Human-readable description of the step.
        description: String,
    },
    /// Closes the innermost step frame.
    StepEnd {
        /// Must match the name of the step being closed.
        step: String,
    },
    /// Appends a measurement to the current frame.
    Measurement {
        /// Measurement name (prefixed by the open step path).
        name: String,
        /// Measurement value.
        value: f64,
        /// Measurement unit.
        unit: String,
    },
    /// Appends a named boolean result to the current frame.
    Result {
        /// Result name.
        name: String,
        /// Whether the named check passed.
        passed: bool,
    },
    /// Appends a feature record, used by dependency inference.
    Feature {
        /// Feature name.
        name: String,
        /// The action taken against the feature.
        action: String,
    },
    /// Appends an error, marking the frame and all ancestor step frames
    /// failed.
    Error {
        /// Error name.
        name: String,
        /// Human-readable error message.
        message: String,
    },
}

/// The kind of a top-level block frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Test-infrastructure setup. Errors here are "rigging failures".
    Rigging,
    /// The action under test.
    Stimulation,
    /// An intermediate assertion point.
    Checkpoint,
    /// The final verdict of the test.
    Verdict,
    /// Anything that doesn't fit the above.
    Other,
}

impl BlockKind {
    /// Parses a block name into a [`BlockKind`], defaulting to
    /// [`BlockKind::Other`] for anything unrecognized -- an unknown
    /// block name is not a parse error; tests are free to use
    /// additional descriptive block names beyond the five known kinds.
    pub fn from_name(name: &str) -> Self {
        match name {
            "rigging" => Self::Rigging,
            "stimulation" => Self::Stimulation,
            "checkpoint" => Self::Checkpoint,
            "verdict" => Self::Verdict,
            _ => Self::Other,
        }
    }
}

/// A measurement attached to a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measurement name, prefixed by the open step path at the time it
    /// was recorded.
    pub name: String,
    /// Measurement value.
    pub value: f64,
    /// Measurement unit.
    pub unit: String,
}

/// A named boolean result attached to a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Result name.
    pub name: String,
    /// Whether the named check passed.
    pub passed: bool,
}

/// A feature record attached to a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Feature name.
    pub name: String,
    /// The action taken against the feature.
    pub action: String,
}

/// An error attached to a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error name.
    pub name: String,
    /// Human-readable error message.
    pub message: String,
}

/// A parse error recovered from during log parsing; parsing continues
/// rather than aborting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParseErrorEvent {
    /// What went wrong, in human-readable form.
    pub message: String,
    /// The raw line that triggered the error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_line: Option<String>,
}

/// An ordered step or block frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// The step or block name.
    pub name: String,
    /// Measurements recorded directly against this frame.
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    /// Named boolean results recorded directly against this frame.
    #[serde(default)]
    pub results: Vec<CheckResult>,
    /// Feature records recorded directly against this frame.
    #[serde(default)]
    pub features: Vec<Feature>,
    /// Errors recorded directly against this frame.
    #[serde(default)]
    pub errors: Vec<ErrorEvent>,
    /// Nested step frames, in emission order.
    #[serde(default)]
    pub children: Vec<Frame>,
    /// True iff any contained result is false, any error appears, or
    /// any child step is failed.
    pub failed: bool,
}

impl Frame {
    /// A fresh, empty frame.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            measurements: Vec::new(),
            results: Vec::new(),
            features: Vec::new(),
            errors: Vec::new(),
            children: Vec::new(),
            failed: false,
        }
    }
}

/// A top-level block frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The block's kind.
    pub kind: BlockKind,
    /// The block's frame (name, measurements/results/etc., and nested
    /// steps).
    pub frame: Frame,
}

/// The aggregate structured-log record for one test run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredLog {
    /// Ordered sequence of block frames.
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// True iff any error is attached to a frame whose enclosing block
    /// is `rigging`.
    #[serde(default)]
    pub has_rigging_failure: bool,
    /// Parse errors recovered from during parsing.
    #[serde(default)]
    pub parse_errors: Vec<ParseErrorEvent>,
}
