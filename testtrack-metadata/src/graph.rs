// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The co-occurrence graph wire format.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A commit reference as recorded against a single file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitRef {
    /// The commit SHA.
    pub commit: String,
    /// When the commit was made.
    pub timestamp: DateTime<Utc>,
}

/// The files touched by a single commit, already classified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitFiles {
    /// When the commit was made.
    pub timestamp: DateTime<Utc>,
    /// Source files touched by the commit.
    pub source_files: Vec<String>,
    /// Test files touched by the commit.
    pub test_files: Vec<String>,
}

/// Bookkeeping about how the graph was built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// When the graph was (re)built.
    pub built_at: DateTime<Utc>,
    /// The most recent commit folded into the graph, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
    /// Total number of commits that contributed signal (commits with
    /// no source file touched are not counted).
    pub total_commits_analyzed: usize,
    /// Source file extensions used for classification.
    pub source_extensions: Vec<String>,
    /// Glob patterns used to classify a file as a test file.
    pub test_patterns: Vec<String>,
}

/// The two-index co-occurrence graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CooccurrenceGraph {
    /// Build metadata.
    pub metadata: GraphMetadata,
    /// `path -> [{commit, timestamp}, ...]`, ordered by timestamp
    /// ascending.
    #[serde(default)]
    pub file_commits: IndexMap<String, Vec<CommitRef>>,
    /// `sha -> {timestamp, source_files, test_files}`.
    #[serde(default)]
    pub commit_files: IndexMap<String, CommitFiles>,
}

impl CooccurrenceGraph {
    /// An empty graph, as used when no graph file exists yet or the
    /// file on disk is corrupt.
    pub fn empty(source_extensions: Vec<String>, test_patterns: Vec<String>) -> Self {
        Self {
            metadata: GraphMetadata {
                built_at: Utc::now(),
                last_commit: None,
                total_commits_analyzed: 0,
                source_extensions,
                test_patterns,
            },
            file_commits: IndexMap::new(),
            commit_files: IndexMap::new(),
        }
    }
}
