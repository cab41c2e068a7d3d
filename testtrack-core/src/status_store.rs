// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The durable status file.
//!
//! Writes are atomic-replace via `atomicwrites::AtomicFile`: serialize,
//! write to a temp sibling, fsync on close, rename over the target.
//! Single-writer discipline is the caller's responsibility -- this
//! module only guarantees that one `save` call is atomic, not that
//! concurrent callers don't race.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use std::io::Write;
use testtrack_metadata::{
    Label,
    status::{HistoryEntry, StatusEntry, StatusFile},
};
use tracing::warn;

use crate::errors::CoreError;

/// Loads a status file from `path`, returning an empty file if it's
/// missing or fails to parse, logging a warning either way.
pub fn load(path: &Utf8Path) -> StatusFile {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StatusFile::empty(),
        Err(err) => {
            warn!(%path, error = %err, "failed to read status file, treating as empty");
            return StatusFile::empty();
        }
    };
    match serde_json::from_str(&text) {
        Ok(status) => status,
        Err(err) => {
            warn!(%path, error = %err, "status file is corrupt, treating as empty");
            StatusFile::empty()
        }
    }
}

/// Serializes `status` and atomically replaces the file at `path`.
pub fn save(path: &Utf8Path, status: &StatusFile) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(status).expect("StatusFile is always serializable");
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

/// Operations on [`StatusFile`] beyond plain map access.
///
/// Implemented as an extension trait rather than living directly on
/// `StatusFile` since that type belongs to `testtrack-metadata`, which
/// has no business knowing about the core's monotonicity/cap
/// invariants.
pub trait StatusFileOps {
    /// Returns the entry for `label`, if any.
    fn get(&self, label: &Label) -> Option<&StatusEntry>;

    /// Applies `mutator` to the entry for `label`, creating a fresh
    /// `new` entry first if none exists, then enforces that
    /// `last_updated` is monotonic: if `mutator` left `last_updated` no
    /// later than it was before the call, it's bumped forward to `now`
    /// rather than rejecting the write.
    fn upsert(&mut self, label: &Label, now: DateTime<Utc>, mutator: impl FnOnce(&mut StatusEntry));

    /// Appends a history entry to `label`, enforcing the 500-entry cap.
    fn append_history(&mut self, label: &Label, now: DateTime<Utc>, entry: HistoryEntry);

    /// Records a content digest against `label`.
    fn set_target_hash(&mut self, label: &Label, now: DateTime<Utc>, hash: String);
}

impl StatusFileOps for StatusFile {
    fn get(&self, label: &Label) -> Option<&StatusEntry> {
        self.tests.get(label)
    }

    fn upsert(&mut self, label: &Label, now: DateTime<Utc>, mutator: impl FnOnce(&mut StatusEntry)) {
        let entry = self
            .tests
            .entry(label.clone())
            .or_insert_with(|| StatusEntry::new(now));
        let previous_updated = entry.last_updated;
        mutator(entry);
        if entry.last_updated <= previous_updated {
            entry.last_updated = now.max(previous_updated);
        }
    }

    fn append_history(&mut self, label: &Label, now: DateTime<Utc>, entry: HistoryEntry) {
        self.upsert(label, now, |status| status.push_history(entry));
    }

    fn set_target_hash(&mut self, label: &Label, now: DateTime<Utc>, hash: String) {
        self.upsert(label, now, |status| status.target_hash = Some(hash));
    }
}
