// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::label::Label;

/// Errors produced while validating or deserializing testtrack's wire
/// formats.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetadataError {
    /// A label failed [`crate::label::is_valid_label`].
    #[error("invalid test label: `{0}`")]
    InvalidLabel(String),

    /// A test set referenced a test label that isn't in `test_set_tests`.
    #[error("test set `{set}` references unknown test `{label}`")]
    UnknownTestInSet {
        /// The test set's name.
        set: String,
        /// The dangling label.
        label: Label,
    },

    /// A test set referenced a subset name that collides with another
    /// subset at the same nesting level.
    #[error("duplicate subset name `{0}` under the same parent")]
    DuplicateSubset(String),

    /// Failed to parse a manifest, status file, or graph file as JSON.
    #[error("failed to parse {kind} at `{path}`")]
    Json {
        /// What was being parsed (`"manifest"`, `"status file"`, ...).
        kind: &'static str,
        /// The file path, for diagnostics.
        path: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}
