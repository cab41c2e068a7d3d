// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The file <-> commit co-occurrence graph.
//!
//! The VCS collaborator is a small trait, [`CommitSource`], so the
//! builder is unit-testable without a real repository. The shipped
//! implementation, [`GitCommitSource`], shells out to `git log` via
//! `duct`, used for exactly this kind of "run an external program and
//! read its output" task in plain (non-async) code, as opposed to
//! `tokio::process` which the executor uses because it needs
//! concurrent children.

use std::collections::BTreeSet;
use std::io::Write;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use testtrack_metadata::graph::{CommitFiles, CommitRef, CooccurrenceGraph};
use tracing::warn;

use crate::errors::CoreError;

/// Loads a co-occurrence graph from `path`, returning an empty graph
/// (with `rules`' extensions/patterns recorded into its metadata) if
/// the file is missing or corrupt. Never throws: callers always get a
/// usable graph back.
pub fn load(path: &Utf8Path, rules: &ClassificationRules) -> CooccurrenceGraph {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return CooccurrenceGraph::empty(rules.source_extensions(), rules.test_patterns().to_vec());
        }
        Err(err) => {
            warn!(%path, error = %err, "failed to read co-occurrence graph, treating as empty");
            return CooccurrenceGraph::empty(rules.source_extensions(), rules.test_patterns().to_vec());
        }
    };
    match serde_json::from_str(&text) {
        Ok(graph) => graph,
        Err(err) => {
            warn!(%path, error = %err, "co-occurrence graph is corrupt, treating as empty");
            CooccurrenceGraph::empty(rules.source_extensions(), rules.test_patterns().to_vec())
        }
    }
}

/// Serializes `graph` and atomically replaces the file at `path`, the
/// same atomic-replace discipline `status_store::save` uses for the
/// status file.
pub fn save(path: &Utf8Path, graph: &CooccurrenceGraph) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(graph).expect("CooccurrenceGraph is always serializable");
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|file| file.write_all(json.as_bytes()))
        .map_err(|err| CoreError::Io {
            path: path.to_owned(),
            source: match err {
                atomicwrites::Error::Internal(io) => io,
                atomicwrites::Error::User(io) => io,
            },
        })
}

/// One commit's metadata and the files it touched, as reported by a
/// [`CommitSource`].
#[derive(Clone, Debug, PartialEq)]
pub struct CommitInfo {
    /// The commit SHA.
    pub sha: String,
    /// When the commit was made.
    pub timestamp: DateTime<Utc>,
    /// Every file path touched by the commit, unclassified.
    pub files: Vec<String>,
}

/// A source of commit history, abstracting over the real VCS.
pub trait CommitSource {
    /// Returns every commit strictly after `after` (or all commits, if
    /// `after` is `None`), in ascending timestamp order.
    fn commits_since(&self, after: Option<&str>) -> Result<Vec<CommitInfo>, CoreError>;
}

/// Shells out to `git log` to enumerate commit history.
#[derive(Clone, Debug)]
pub struct GitCommitSource {
    /// The repository root to run `git` in.
    pub repo_root: Utf8PathBuf,
}

impl CommitSource for GitCommitSource {
    fn commits_since(&self, after: Option<&str>) -> Result<Vec<CommitInfo>, CoreError> {
        let range = match after {
            Some(sha) => format!("{sha}..HEAD"),
            None => "HEAD".to_string(),
        };
        let output = duct::cmd!(
            "git",
            "-C",
            self.repo_root.as_str(),
            "log",
            "--reverse",
            "--name-only",
            "--pretty=format:COMMIT %H %aI",
            &range
        )
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|err| CoreError::VcsUnavailable {
            message: err.to_string(),
        })?;

        if !output.status.success() {
            return Err(CoreError::VcsUnavailable {
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        parse_git_log(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_git_log(text: &str) -> Result<Vec<CommitInfo>, CoreError> {
    let mut commits = Vec::new();
    let mut current: Option<CommitInfo> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("COMMIT ") {
            if let Some(commit) = current.take() {
                commits.push(commit);
            }
            let mut parts = rest.splitn(2, ' ');
            let sha = parts.next().unwrap_or_default().to_string();
            let ts_str = parts.next().unwrap_or_default();
            let timestamp = DateTime::parse_from_rfc3339(ts_str)
                .map_err(|err| CoreError::VcsUnavailable {
                    message: format!("unparseable commit timestamp `{ts_str}`: {err}"),
                })?
                .with_timezone(&Utc);
            current = Some(CommitInfo {
                sha,
                timestamp,
                files: Vec::new(),
            });
        } else if !line.trim().is_empty() {
            if let Some(commit) = current.as_mut() {
                commit.files.push(line.trim().to_string());
            }
        }
    }
    if let Some(commit) = current.take() {
        commits.push(commit);
    }
    Ok(commits)
}

/// The result of classifying one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileClass {
    /// A source file, contributing co-change signal.
    Source,
    /// A test file.
    Test,
    /// Neither -- carries no signal.
    Ignored,
}

/// File-classification rules.
#[derive(Clone, Debug)]
pub struct ClassificationRules {
    source_extensions: BTreeSet<String>,
    test_patterns: Vec<String>,
    test_globs: GlobSet,
}

impl ClassificationRules {
    /// Builds classification rules from explicit extension and glob
    /// lists.
    pub fn new(source_extensions: Vec<String>, test_patterns: Vec<String>) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &test_patterns {
            builder.add(Glob::new(pattern).expect("test pattern must be a valid glob"));
        }
        let test_globs = builder.build().expect("globset builds from valid patterns");
        Self {
            source_extensions: source_extensions.into_iter().collect(),
            test_patterns,
            test_globs,
        }
    }

    /// The default rule set: `.py .java .cc .go .rs .ts .js .bzl` as
    /// source extensions, `*_test.* test_*.* *_spec.*` as test
    /// patterns.
    pub fn defaults() -> Self {
        Self::new(
            [".py", ".java", ".cc", ".go", ".rs", ".ts", ".js", ".bzl"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ["*_test.*", "test_*.*", "*_spec.*"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// The raw test-pattern globs, for persisting into graph metadata.
    pub fn test_patterns(&self) -> &[String] {
        &self.test_patterns
    }

    /// The raw source extensions, for persisting into graph metadata.
    pub fn source_extensions(&self) -> Vec<String> {
        self.source_extensions.iter().cloned().collect()
    }

    /// Classifies `path`. Test pattern match wins over source
    /// extension.
    pub fn classify(&self, path: &str) -> FileClass {
        let utf8 = Utf8Path::new(path);
        let basename = utf8.file_name().unwrap_or(path);
        if self.test_globs.is_match(basename) {
            return FileClass::Test;
        }
        if let Some(ext) = utf8.extension() {
            if self.source_extensions.contains(&format!(".{ext}")) {
                return FileClass::Source;
            }
        }
        FileClass::Ignored
    }
}

/// Builds or incrementally updates `existing` with commits from
/// `source`.
pub fn build(
    source: &dyn CommitSource,
    mut existing: CooccurrenceGraph,
    rules: &ClassificationRules,
) -> Result<CooccurrenceGraph, CoreError> {
    let commits = source.commits_since(existing.metadata.last_commit.as_deref())?;

    for commit in commits {
        if existing.commit_files.contains_key(&commit.sha) {
            continue;
        }

        let mut source_files = Vec::new();
        let mut test_files = Vec::new();
        for path in &commit.files {
            match rules.classify(path) {
                FileClass::Source => source_files.push(path.clone()),
                FileClass::Test => test_files.push(path.clone()),
                FileClass::Ignored => {}
            }
        }

        if source_files.is_empty() {
            // No signal: a commit touching only tests, docs, or
            // ignored files tells us nothing about co-change (spec
            // §4.7, §3 invariant).
            continue;
        }

        existing.commit_files.insert(
            commit.sha.clone(),
            CommitFiles {
                timestamp: commit.timestamp,
                source_files: source_files.clone(),
                test_files: test_files.clone(),
            },
        );
        for path in source_files.iter().chain(test_files.iter()) {
            existing
                .file_commits
                .entry(path.clone())
                .or_default()
                .push(CommitRef {
                    commit: commit.sha.clone(),
                    timestamp: commit.timestamp,
                });
        }
        existing.metadata.total_commits_analyzed += 1;
        existing.metadata.last_commit = Some(commit.sha.clone());
    }

    existing.metadata.built_at = Utc::now();
    existing.metadata.source_extensions = rules.source_extensions();
    existing.metadata.test_patterns = rules.test_patterns().to_vec();
    Ok(existing)
}
