// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The manifest wire format.

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{errors::MetadataError, label::Label, label::is_valid_label};

/// A single test node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestNode {
    /// Human-readable description of what the test asserts.
    pub assertion: String,
    /// Path to the compiled test executable.
    pub executable: Utf8PathBuf,
    /// Labels of tests that must pass before this one is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Label>,
    /// Optional external requirement tag (traceability, not interpreted
    /// by the core).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement_id: Option<String>,
    /// Optional executable that re-judges a verdict from stored
    /// measurements without rerunning the test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgement_executable: Option<Utf8PathBuf>,
    /// Disabled tests are never dispatched in any mode.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Free-form parameters passed through to the child process as
    /// environment variables.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, serde_json::Value>,
}

/// A named, possibly nested, group of tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSetNode {
    /// The set's name, unique among its siblings.
    pub name: String,
    /// Human-readable assertion for the set as a whole.
    #[serde(default)]
    pub assertion: String,
    /// Optional external requirement tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement_id: Option<String>,
    /// Direct test members.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<Label>,
    /// Child sets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<TestSetNode>,
}

impl TestSetNode {
    /// The transitive test closure of this set: its own tests, plus the
    /// transitive closure of every subset.
    pub fn transitive_tests(&self) -> BTreeSet<Label> {
        let mut out = BTreeSet::new();
        self.collect_tests(&mut out);
        out
    }

    fn collect_tests(&self, out: &mut BTreeSet<Label>) {
        out.extend(self.tests.iter().cloned());
        for subset in &self.subsets {
            subset.collect_tests(out);
        }
    }

    /// Validates that every referenced test exists in `known_tests` and
    /// that sibling subset names don't collide.
    pub fn validate(&self, known_tests: &IndexMap<Label, TestNode>) -> Result<(), MetadataError> {
        for label in &self.tests {
            if !known_tests.contains_key(label) {
                return Err(MetadataError::UnknownTestInSet {
                    set: self.name.clone(),
                    label: label.clone(),
                });
            }
        }
        let mut seen = BTreeSet::new();
        for subset in &self.subsets {
            if !seen.insert(subset.name.clone()) {
                return Err(MetadataError::DuplicateSubset(subset.name.clone()));
            }
            subset.validate(known_tests)?;
        }
        Ok(())
    }
}

/// The top-level manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// The root test set (the DAG of sets).
    pub test_set: TestSetNode,
    /// Every test node, keyed by label.
    pub test_set_tests: IndexMap<Label, TestNode>,
}

impl Manifest {
    /// Parses a manifest from JSON text, validating set/test references
    /// (but not DAG acyclicity -- that's `testtrack_core::dag::Dag::build`'s
    /// job, since it needs richer cycle-reporting than this crate owns).
    pub fn from_json(text: &str) -> Result<Self, MetadataError> {
        let manifest: Manifest =
            serde_json::from_str(text).map_err(|source| MetadataError::Json {
                kind: "manifest",
                path: "<in-memory>".to_string(),
                source,
            })?;
        for label in manifest.test_set_tests.keys() {
            if !is_valid_label(label.as_str()) {
                return Err(MetadataError::InvalidLabel(label.to_string()));
            }
        }
        manifest.test_set.validate(&manifest.test_set_tests)?;
        Ok(manifest)
    }

    /// All enabled test labels; disabled tests are never dispatched.
    pub fn enabled_tests(&self) -> impl Iterator<Item = &Label> {
        self.test_set_tests
            .iter()
            .filter(|(_, node)| !node.disabled)
            .map(|(label, _)| label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(deps: &[&str]) -> TestNode {
        TestNode {
            assertion: "does a thing".to_string(),
            executable: "bin/t".into(),
            depends_on: deps.iter().map(|s| Label::from(*s)).collect(),
            requirement_id: None,
            judgement_executable: None,
            disabled: false,
            parameters: IndexMap::new(),
        }
    }

    #[test]
    fn transitive_closure_includes_subsets() {
        let set = TestSetNode {
            name: "root".to_string(),
            assertion: String::new(),
            requirement_id: None,
            tests: vec![Label::from("a")],
            subsets: vec![TestSetNode {
                name: "child".to_string(),
                assertion: String::new(),
                requirement_id: None,
                tests: vec![Label::from("b"), Label::from("c")],
                subsets: vec![],
            }],
        };
        assert_eq!(
            set.transitive_tests(),
            BTreeSet::from([Label::from("a"), Label::from("b"), Label::from("c")])
        );
    }

    #[test]
    fn validate_rejects_unknown_test() {
        let mut known = IndexMap::new();
        known.insert(Label::from("a"), node(&[]));
        let set = TestSetNode {
            name: "root".to_string(),
            assertion: String::new(),
            requirement_id: None,
            tests: vec![Label::from("missing")],
            subsets: vec![],
        };
        assert!(matches!(
            set.validate(&known),
            Err(MetadataError::UnknownTestInSet { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_subset_names() {
        let known = IndexMap::new();
        let set = TestSetNode {
            name: "root".to_string(),
            assertion: String::new(),
            requirement_id: None,
            tests: vec![],
            subsets: vec![
                TestSetNode {
                    name: "dup".to_string(),
                    assertion: String::new(),
                    requirement_id: None,
                    tests: vec![],
                    subsets: vec![],
                },
                TestSetNode {
                    name: "dup".to_string(),
                    assertion: String::new(),
                    requirement_id: None,
                    tests: vec![],
                    subsets: vec![],
                },
            ],
        };
        assert!(matches!(
            set.validate(&known),
            Err(MetadataError::DuplicateSubset(_))
        ));
    }

    #[test]
    fn from_json_rejects_invalid_label() {
        let json = r#"{
            "test_set": {"name": "root", "tests": ["has space"], "subsets": []},
            "test_set_tests": {"has space": {"assertion": "x", "executable": "bin/t"}}
        }"#;
        assert!(matches!(
            Manifest::from_json(json),
            Err(MetadataError::InvalidLabel(_))
        ));
    }

    #[test]
    fn enabled_tests_excludes_disabled() {
        let mut tests = IndexMap::new();
        tests.insert(Label::from("a"), node(&[]));
        let mut disabled = node(&[]);
        disabled.disabled = true;
        tests.insert(Label::from("b"), disabled);
        let manifest = Manifest {
            test_set: TestSetNode {
                name: "root".to_string(),
                assertion: String::new(),
                requirement_id: None,
                tests: vec![Label::from("a"), Label::from("b")],
                subsets: vec![],
            },
            test_set_tests: tests,
        };
        let enabled: Vec<_> = manifest.enabled_tests().cloned().collect();
        assert_eq!(enabled, vec![Label::from("a")]);
    }
}
