// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-label measurement persistence.
//!
//! One JSON file per test, named from a sanitized label so a label
//! containing path separators or other unsafe characters can never
//! escape the store directory.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::Write;
use testtrack_metadata::Label;
use testtrack_metadata::log_event::Measurement;
use tracing::warn;

use crate::errors::CoreError;

/// Maps a label to a filesystem-safe filename: any character outside
/// `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_filename(label: &Label) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn path_for(dir: &Utf8Path, label: &Label) -> Utf8PathBuf {
    dir.join(format!("{}.json", sanitize_filename(label)))
}

/// Overwrites the stored measurements for `label`.
pub fn store(dir: &Utf8Path, label: &Label, measurements: &[Measurement]) -> Result<(), CoreError> {
    let path = path_for(dir, label);
    let json = serde_json::to_string_pretty(measurements).expect("measurements are always serializable");
    AtomicFile::new(&path, OverwriteBehavior::AllowOverwrite)
        .write(|file| file.write_all(json.as_bytes()))
        .map_err(|err| CoreError::Io {
            path: path.clone(),
            source: match err {
                atomicwrites::Error::Internal(io) => io,
                atomicwrites::Error::User(io) => io,
            },
        })
}

/// Returns the stored measurements for `label`, or `None` if no record
/// exists or the file is corrupt.
pub fn load(dir: &Utf8Path, label: &Label) -> Option<Vec<Measurement>> {
    let path = path_for(dir, label);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(%path, error = %err, "failed to read measurement file, treating as absent");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(measurements) => Some(measurements),
        Err(err) => {
            warn!(%path, error = %err, "measurement file is corrupt, treating as absent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_dir(name: &str) -> Utf8PathBuf {
        let mut dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .expect("temp dir is valid UTF-8 on test platforms");
        dir.push(format!("testtrack-measurement-store-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        let label = Label::from("suite::case/1");
        assert_eq!(sanitize_filename(&label), "suite__case_1");
    }

    #[test]
    fn load_missing_is_absent() {
        let dir = temp_dir("missing");
        assert_eq!(load(&dir, &Label::from("t1")), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = temp_dir("roundtrip");
        let label = Label::from("t1");
        let measurements = vec![Measurement {
            name: "latency_ms".to_string(),
            value: 12.5,
            unit: "ms".to_string(),
        }];
        store(&dir, &label, &measurements).unwrap();
        assert_eq!(load(&dir, &label), Some(measurements));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_overwrites_prior_record() {
        let dir = temp_dir("overwrite");
        let label = Label::from("t1");
        store(
            &dir,
            &label,
            &[Measurement {
                name: "a".to_string(),
                value: 1.0,
                unit: "ms".to_string(),
            }],
        )
        .unwrap();
        store(&dir, &label, &[]).unwrap();
        assert_eq!(load(&dir, &label), Some(vec![]));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_treated_as_absent() {
        let dir = temp_dir("corrupt");
        let label = Label::from("t1");
        std::fs::write(path_for(&dir, &label), b"not json").unwrap();
        assert_eq!(load(&dir, &label), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
