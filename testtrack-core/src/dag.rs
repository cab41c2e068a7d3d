// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The execution graph over test labels.
//!
//! Cycle detection builds a small `petgraph::Graph`, then runs
//! `kosaraju_scc` and treats any strongly-connected component of size
//! >= 2 (or a self-loop) as a cycle. Traversal (topological order,
//! BFS, closure, descendants) is done directly over plain adjacency
//! maps rather than through petgraph, since those operations need
//! label-level tie-breaking that doesn't map cleanly onto petgraph's
//! generic graph algorithms.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::{Directed, Graph, algo::scc::kosaraju_scc, graph::NodeIndex};
use testtrack_metadata::{Label, manifest::Manifest};

use crate::errors::CoreError;

/// The execution graph: nodes are test labels, edges point from a
/// dependent to its prerequisites.
#[derive(Clone, Debug)]
pub struct Dag {
    nodes: BTreeSet<Label>,
    /// `label -> prerequisites` (what `label` depends on).
    depends_on: BTreeMap<Label, Vec<Label>>,
    /// `label -> dependents` (what depends on `label`), the reverse of
    /// `depends_on`.
    dependents: BTreeMap<Label, Vec<Label>>,
}

impl Dag {
    /// Builds a DAG from a manifest's test nodes.
    ///
    /// Fails with [`CoreError::UnknownDep`] if a `depends_on` label
    /// doesn't resolve to a known test, or [`CoreError::CycleInDag`] if
    /// any strongly-connected component exceeds size 1.
    pub fn build(manifest: &Manifest) -> Result<Self, CoreError> {
        let nodes: BTreeSet<Label> = manifest.test_set_tests.keys().cloned().collect();

        let mut depends_on: BTreeMap<Label, Vec<Label>> = BTreeMap::new();
        let mut dependents: BTreeMap<Label, Vec<Label>> = BTreeMap::new();
        for label in &nodes {
            depends_on.entry(label.clone()).or_default();
            dependents.entry(label.clone()).or_default();
        }

        for (label, node) in &manifest.test_set_tests {
            for dep in &node.depends_on {
                if !nodes.contains(dep) {
                    return Err(CoreError::UnknownDep {
                        label: label.clone(),
                        dependency: dep.clone(),
                    });
                }
                depends_on.entry(label.clone()).or_default().push(dep.clone());
                dependents.entry(dep.clone()).or_default().push(label.clone());
            }
        }
        for deps in depends_on.values_mut() {
            deps.sort();
        }
        for deps in dependents.values_mut() {
            deps.sort();
        }

        let dag = Self {
            nodes,
            depends_on,
            dependents,
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        let mut graph = Graph::<Label, (), Directed>::new();
        let mut index_of: BTreeMap<Label, NodeIndex> = BTreeMap::new();
        for label in &self.nodes {
            let idx = graph.add_node(label.clone());
            index_of.insert(label.clone(), idx);
        }
        for (label, deps) in &self.depends_on {
            let from = index_of[label];
            for dep in deps {
                let to = index_of[dep];
                graph.add_edge(from, to, ());
            }
        }

        let sccs = kosaraju_scc(&graph);
        for scc in sccs {
            let is_cycle = scc.len() >= 2
                || scc
                    .first()
                    .is_some_and(|&idx| graph.find_edge(idx, idx).is_some());
            if is_cycle {
                let mut cycle: Vec<Label> = scc.iter().map(|&idx| graph[idx].clone()).collect();
                cycle.sort();
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                return Err(CoreError::CycleInDag { cycle });
            }
        }
        Ok(())
    }

    /// All labels in the graph.
    pub fn nodes(&self) -> &BTreeSet<Label> {
        &self.nodes
    }

    /// The direct prerequisites of `label`, or an empty slice if
    /// `label` is unknown or has none.
    pub fn prerequisites_of(&self, label: &Label) -> &[Label] {
        self.depends_on.get(label).map_or(&[], |v| v.as_slice())
    }

    /// The tests that directly depend on `label`.
    pub fn dependents_of(&self, label: &Label) -> &[Label] {
        self.dependents.get(label).map_or(&[], |v| v.as_slice())
    }

    /// Leaves-first topological order over `nodes`, breaking ties by
    /// lexicographic label order within a layer so parallel result
    /// attribution is reproducible.
    pub fn topological(&self, nodes: &BTreeSet<Label>) -> Vec<Label> {
        let mut remaining_deps: BTreeMap<Label, BTreeSet<Label>> = BTreeMap::new();
        for label in nodes {
            let deps: BTreeSet<Label> = self
                .prerequisites_of(label)
                .iter()
                .filter(|d| nodes.contains(*d))
                .cloned()
                .collect();
            remaining_deps.insert(label.clone(), deps);
        }

        let mut out = Vec::with_capacity(nodes.len());
        let mut done: BTreeSet<Label> = BTreeSet::new();
        while done.len() < nodes.len() {
            let ready: BTreeSet<Label> = remaining_deps
                .iter()
                .filter(|(label, deps)| !done.contains(*label) && deps.is_empty())
                .map(|(label, _)| label.clone())
                .collect();
            // An empty ready set with unfinished nodes would mean a
            // cycle slipped past `build`; that can't happen since
            // `build` always checks acyclicity first.
            debug_assert!(!ready.is_empty() || done.len() == nodes.len());
            for label in &ready {
                done.insert(label.clone());
                out.push(label.clone());
            }
            for deps in remaining_deps.values_mut() {
                for label in &ready {
                    deps.remove(label);
                }
            }
        }
        out
    }

    /// Roots-first (no dependents) BFS order over `nodes`, used for
    /// detection-mode dispatch.
    pub fn bfs_from_roots(&self, nodes: &BTreeSet<Label>) -> Vec<Label> {
        let roots: BTreeSet<Label> = nodes
            .iter()
            .filter(|label| {
                self.dependents_of(label)
                    .iter()
                    .all(|d| !nodes.contains(d))
            })
            .cloned()
            .collect();

        let mut visited: BTreeSet<Label> = BTreeSet::new();
        let mut queue: VecDeque<Label> = roots.into_iter().collect();
        let mut out = Vec::with_capacity(nodes.len());

        while let Some(label) = queue.pop_front() {
            if !visited.insert(label.clone()) {
                continue;
            }
            out.push(label.clone());
            let mut next: Vec<Label> = self
                .prerequisites_of(&label)
                .iter()
                .filter(|d| nodes.contains(*d) && !visited.contains(*d))
                .cloned()
                .collect();
            next.sort();
            queue.extend(next);
        }

        // Any node unreachable from a root (shouldn't happen in a
        // connected acyclic graph restricted to `nodes`, but a
        // `closure`-less subset could leave orphans) is appended in
        // label order so the BFS is still total over `nodes`.
        let mut stragglers: Vec<Label> = nodes.difference(&visited).cloned().collect();
        stragglers.sort();
        out.extend(stragglers);
        out
    }

    /// `subset` plus every transitive prerequisite, so the result is
    /// self-contained.
    pub fn closure(&self, subset: &BTreeSet<Label>) -> BTreeSet<Label> {
        let mut out: BTreeSet<Label> = subset.clone();
        let mut queue: VecDeque<Label> = subset.iter().cloned().collect();
        while let Some(label) = queue.pop_front() {
            for dep in self.prerequisites_of(&label) {
                if out.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
        out
    }

    /// Every test that transitively depends on `label`, used to
    /// cascade `dependencies_failed`.
    pub fn descendants(&self, label: &Label) -> BTreeSet<Label> {
        let mut out: BTreeSet<Label> = BTreeSet::new();
        let mut queue: VecDeque<Label> = self.dependents_of(label).to_vec().into();
        while let Some(current) = queue.pop_front() {
            if out.insert(current.clone()) {
                for dependent in self.dependents_of(&current) {
                    queue.push_back(dependent.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;
    use testtrack_metadata::manifest::{TestNode, TestSetNode};

    fn node(deps: &[&str]) -> TestNode {
        TestNode {
            assertion: String::new(),
            executable: "bin/t".into(),
            depends_on: deps.iter().map(|s| Label::from(*s)).collect(),
            requirement_id: None,
            judgement_executable: None,
            disabled: false,
            parameters: IndexMap::new(),
        }
    }

    fn manifest(edges: &[(&str, &[&str])]) -> Manifest {
        let mut tests = IndexMap::new();
        let mut all_labels = BTreeSet::new();
        for (label, deps) in edges {
            all_labels.insert(Label::from(*label));
            for d in *deps {
                all_labels.insert(Label::from(*d));
            }
        }
        for label in &all_labels {
            let deps = edges
                .iter()
                .find(|(l, _)| *l == label.as_str())
                .map(|(_, d)| *d)
                .unwrap_or(&[]);
            tests.insert(label.clone(), node(deps));
        }
        Manifest {
            test_set: TestSetNode {
                name: "root".to_string(),
                assertion: String::new(),
                requirement_id: None,
                tests: all_labels.into_iter().collect(),
                subsets: vec![],
            },
            test_set_tests: tests,
        }
    }

    #[test]
    fn linear_chain_gating() {
        // A -> B -> C (B depends on A, C depends on B), per the §8
        // "Gating" scenario.
        let m = manifest(&[("b", &["a"]), ("c", &["b"])]);
        let dag = Dag::build(&m).unwrap();
        assert_eq!(
            dag.topological(dag.nodes()),
            vec![Label::from("a"), Label::from("b"), Label::from("c")]
        );
        assert_eq!(
            dag.descendants(&Label::from("a")),
            BTreeSet::from([Label::from("b"), Label::from("c")])
        );
    }

    #[test]
    fn detects_cycle() {
        let m = manifest(&[("a", &["b"]), ("b", &["a"])]);
        let err = Dag::build(&m).unwrap_err();
        assert!(matches!(err, CoreError::CycleInDag { .. }));
    }

    #[test]
    fn detects_self_loop() {
        let m = manifest(&[("a", &["a"])]);
        let err = Dag::build(&m).unwrap_err();
        assert!(matches!(err, CoreError::CycleInDag { .. }));
    }

    #[test]
    fn detects_unknown_dep() {
        let m = manifest(&[("a", &["missing"])]);
        let err = Dag::build(&m).unwrap_err();
        assert!(matches!(err, CoreError::UnknownDep { .. }));
    }

    #[test]
    fn topological_breaks_ties_lexicographically() {
        // Two independent roots with no edges between them: b, a.
        let m = manifest(&[("a", &[]), ("b", &[])]);
        let dag = Dag::build(&m).unwrap();
        assert_eq!(
            dag.topological(dag.nodes()),
            vec![Label::from("a"), Label::from("b")]
        );
    }

    #[test]
    fn closure_adds_transitive_prerequisites() {
        let m = manifest(&[("b", &["a"]), ("c", &["b"])]);
        let dag = Dag::build(&m).unwrap();
        let seed = BTreeSet::from([Label::from("c")]);
        assert_eq!(
            dag.closure(&seed),
            BTreeSet::from([Label::from("a"), Label::from("b"), Label::from("c")])
        );
    }

    #[test]
    fn bfs_from_roots_starts_at_independent_tests() {
        let m = manifest(&[("b", &["a"])]);
        let dag = Dag::build(&m).unwrap();
        // `b` has no dependents, so it's the root; `a` is reached next.
        assert_eq!(
            dag.bfs_from_roots(dag.nodes()),
            vec![Label::from("b"), Label::from("a")]
        );
    }
}
