// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the orchestration core.
//!
//! Errors split into two tiers: fatal, cross-cutting errors
//! ([`CoreError`]) that abort the whole run, and per-test errors
//! ([`TestFailureKind`]) that are always converted into a `failed`
//! result rather than propagated.

use camino::Utf8PathBuf;
use testtrack_metadata::Label;
use thiserror::Error;

/// A fatal, cross-cutting error; any variant here aborts the run with
/// exit code 2.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The manifest failed to parse or validate.
    #[error("invalid manifest at `{path}`")]
    InvalidManifest {
        /// The manifest file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: testtrack_metadata::MetadataError,
    },

    /// The execution graph contains a cycle.
    #[error("dependency cycle detected among tests: {}", .cycle.join(" -> "))]
    CycleInDag {
        /// The labels participating in the cycle, in path order.
        cycle: Vec<Label>,
    },

    /// A test or set referenced a dependency label that doesn't exist.
    #[error("test `{label}` depends on unknown test `{dependency}`")]
    UnknownDep {
        /// The test with the dangling dependency.
        label: Label,
        /// The missing dependency's label.
        dependency: Label,
    },

    /// The git VCS collaborator could not be invoked. Fatal for the
    /// subcommand that needed it, but not for the whole binary.
    #[error("version control system unavailable: {message}")]
    VcsUnavailable {
        /// Human-readable detail.
        message: String,
    },

    /// An I/O error that isn't specific to any single test (e.g.
    /// reading the manifest file itself).
    #[error("I/O error at `{path}`")]
    Io {
        /// The path being read or written.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The reason a single test's result was `failed`, beyond a plain
/// non-zero exit code.
#[derive(Clone, Debug, PartialEq, Error)]
#[non_exhaustive]
pub enum TestFailureKind {
    /// The test exited with a non-zero code.
    #[error("exited with code {0}")]
    NonZeroExit(i32),

    /// The child process could not be spawned at all.
    #[error("failed to start process: {0}")]
    SpawnError(String),

    /// The child process terminated due to a signal (unix) or
    /// otherwise crashed rather than exiting normally.
    #[error("process crashed: {0}")]
    Crashed(String),

    /// The test exceeded its configured wallclock timeout.
    #[error("timed out")]
    Timeout,

    /// The run was cancelled before or during this test's execution.
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_message_shows_path() {
        let err = CoreError::CycleInDag {
            cycle: vec![Label::from("a"), Label::from("b"), Label::from("a")],
        };
        assert_eq!(err.to_string(), "dependency cycle detected among tests: a -> b -> a");
    }
}
