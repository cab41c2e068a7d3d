// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stable test identifier used across every component.

use smol_str::SmolStr;

/// An opaque, stable test identifier.
///
/// Labels are never parsed for structure; they are compared and hashed
/// as plain strings. [`SmolStr`] keeps cloning cheap since labels are
/// copied into DAG edges, history entries, and score maps throughout
/// the core.
pub type Label = SmolStr;

/// Returns `true` if `s` is non-empty and contains no whitespace or
/// control characters, the only requirement placed on a label string.
pub fn is_valid_label(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| !c.is_whitespace() && !c.is_control())
}
