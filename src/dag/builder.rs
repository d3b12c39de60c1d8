//! DAG builder: constructs and validates a dependency graph from phase specs.
//!
//! Declared `depends_on` edges are augmented by dependency inference
//! before the graph is validated acyclic and transitively reduced.

use crate::errors::DagError;
use crate::phase::PhaseSpec;
use std::collections::{HashMap, HashSet};

/// Index into the phase list.
pub type PhaseIndex = usize;

/// A directed acyclic graph of phases.
#[derive(Debug)]
pub struct PhaseGraph {
    phases: Vec<PhaseSpec>,
    index_map: HashMap<String, PhaseIndex>,
    forward_edges: Vec<Vec<PhaseIndex>>,
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get_phase(&self, index: PhaseIndex) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    pub fn get_phase_by_id(&self, id: &str) -> Option<&PhaseSpec> {
        self.index_map.get(id).and_then(|&i| self.phases.get(i))
    }

    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Phases that depend on the given phase (forward edges).
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Phases that the given phase depends on (reverse edges).
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn leaf_phases(&self) -> Vec<PhaseIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: PhaseIndex, done: &HashSet<PhaseIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| done.contains(dep))
    }

    /// Transitive downstream count (impact score), used for dispatch
    /// ordering.
    pub fn impact_score(&self, index: PhaseIndex) -> usize {
        let mut seen = HashSet::new();
        let mut stack = vec![index];
        while let Some(node) = stack.pop() {
            for &dependent in self.dependents(node) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen.len()
    }
}

/// Builder for constructing phase graphs, applying dependency inference
/// before validation.
pub struct DagBuilder {
    phases: Vec<PhaseSpec>,
}

impl DagBuilder {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    /// Build the phase graph.
    ///
    /// 1. Declared `depends_on` must reference existing phases.
    /// 2. `blocks` expansion: `A.blocks = [X]` adds `X.depends_on += A`.
    /// 3. Scope-overlap inference: overlapping, non-`allow_scope_overlap`
    ///    scopes get a serializing edge from lower to higher priority
    ///    (tie-break by id).
    /// 4. File-mention inference: if B's body mentions a path within A's
    ///    scope, B depends on A.
    /// 5. Transitive reduction removes redundant edges.
    /// 6. The result must be acyclic.
    pub fn build(self) -> Result<PhaseGraph, DagError> {
        if self.phases.is_empty() {
            return Ok(PhaseGraph {
                phases: Vec::new(),
                index_map: HashMap::new(),
                forward_edges: Vec::new(),
                reverse_edges: Vec::new(),
            });
        }

        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.contains_key(&phase.id) {
                return Err(DagError::DuplicatePhase(phase.id.clone()));
            }
            index_map.insert(phase.id.clone(), i);
        }

        let n = self.phases.len();
        let mut dep_sets: Vec<HashSet<PhaseIndex>> = vec![HashSet::new(); n];

        // Declared depends_on.
        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| DagError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                })?;
                dep_sets[to_idx].insert(from_idx);
            }
        }

        // Blocks expansion: A.blocks = [X] => X depends_on A.
        for (from_idx, phase) in self.phases.iter().enumerate() {
            for blocked in &phase.blocks {
                let to_idx = *index_map.get(blocked).ok_or_else(|| DagError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: blocked.clone(),
                })?;
                dep_sets[to_idx].insert(from_idx);
            }
        }

        // Scope-overlap inference: serialize overlapping, non-overlap-allowed
        // scopes from lower to higher priority; tie-break by id.
        for a in 0..n {
            for b in (a + 1)..n {
                let pa = &self.phases[a];
                let pb = &self.phases[b];
                if pa.allow_scope_overlap || pb.allow_scope_overlap {
                    continue;
                }
                if !pa.scope_overlaps(pb) {
                    continue;
                }
                let (from, to) = if (pa.priority, &pa.id) <= (pb.priority, &pb.id) {
                    (b, a)
                } else {
                    (a, b)
                };
                dep_sets[to].insert(from);
            }
        }

        // File-mention inference: if B's body mentions a path within A's scope,
        // B depends on A.
        for b_idx in 0..n {
            for a_idx in 0..n {
                if a_idx == b_idx {
                    continue;
                }
                let a = &self.phases[a_idx];
                let b = &self.phases[b_idx];
                if a.scope.is_empty() {
                    continue;
                }
                if a.scope.iter().any(|pattern| {
                    let needle = literal_prefix(pattern);
                    !needle.is_empty() && b.body.contains(needle)
                }) {
                    dep_sets[b_idx].insert(a_idx);
                }
            }
        }

        let dep_sets = transitive_reduction(&dep_sets);

        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); n];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); n];
        for (to_idx, deps) in dep_sets.iter().enumerate() {
            let mut sorted: Vec<_> = deps.iter().copied().collect();
            sorted.sort_unstable();
            for from_idx in sorted {
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;
        Ok(graph)
    }

    /// Kahn's algorithm cycle check.
    fn validate_no_cycles(graph: &PhaseGraph) -> Result<(), DagError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|d| d.len()).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_phases: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_phase(i).map(|p| p.id.clone()))
                .collect();
            return Err(DagError::CycleDetected(cycle_phases));
        }
        Ok(())
    }
}

/// Remove edges `a -> c` when a longer path `a -> b -> ... -> c` already
/// covers it, keeping only the edges needed for the transitive closure.
fn transitive_reduction(dep_sets: &[HashSet<PhaseIndex>]) -> Vec<HashSet<PhaseIndex>> {
    let n = dep_sets.len();
    let mut closure: Vec<HashSet<PhaseIndex>> = dep_sets.to_vec();
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            let additions: Vec<PhaseIndex> = closure[i]
                .iter()
                .flat_map(|&d| closure[d].iter().copied())
                .filter(|d| !closure[i].contains(d))
                .collect();
            if !additions.is_empty() {
                changed = true;
                closure[i].extend(additions);
            }
        }
    }

    let mut reduced = dep_sets.to_vec();
    for i in 0..n {
        let direct: Vec<PhaseIndex> = reduced[i].iter().copied().collect();
        for &d in &direct {
            let redundant = direct
                .iter()
                .any(|&d2| d2 != d && closure[d2].contains(&d));
            if redundant {
                reduced[i].remove(&d);
            }
        }
    }
    reduced
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?', '[']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::GateMode;
    use std::collections::HashSet as Set;

    fn phase(id: &str, deps: &[&str]) -> PhaseSpec {
        PhaseSpec {
            id: id.to_string(),
            title: format!("Phase {id}"),
            body: String::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            blocks: Set::new(),
            scope: Vec::new(),
            allow_scope_overlap: false,
            priority: 0,
            max_review_cycles: 5,
            max_budget_usd: 0.0,
            model: "default".into(),
            gate: GateMode::Trust,
            speculative: None,
        }
    }

    #[test]
    fn build_simple_graph() {
        let phases = vec![
            phase("01", &[]),
            phase("02", &["01"]),
            phase("03", &["01"]),
            phase("04", &["02", "03"]),
        ];
        let graph = DagBuilder::new(phases).build().unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.root_phases(), vec![0]);
        assert_eq!(graph.leaf_phases(), vec![3]);
    }

    #[test]
    fn cycle_detection() {
        let phases = vec![
            phase("01", &["03"]),
            phase("02", &["01"]),
            phase("03", &["02"]),
        ];
        let err = DagBuilder::new(phases).build().unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(_)));
    }

    #[test]
    fn missing_dependency() {
        let phases = vec![phase("01", &["nonexistent"])];
        let err = DagBuilder::new(phases).build().unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_phase_id() {
        let phases = vec![phase("01", &[]), phase("01", &[])];
        let err = DagBuilder::new(phases).build().unwrap_err();
        assert!(matches!(err, DagError::DuplicatePhase(_)));
    }

    #[test]
    fn blocks_expansion_adds_reverse_edge() {
        let mut a = phase("01", &[]);
        a.blocks = ["02".to_string()].into_iter().collect();
        let b = phase("02", &[]);
        let graph = DagBuilder::new(vec![a, b]).build().unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
    }

    #[test]
    fn scope_overlap_serializes_by_priority() {
        let mut a = phase("01", &[]);
        a.scope = vec!["src/auth/*.rs".into()];
        a.priority = 5;
        let mut b = phase("02", &[]);
        b.scope = vec!["src/auth/*.rs".into()];
        b.priority = 1;
        // b has higher priority (lower number), so a depends on b.
        let graph = DagBuilder::new(vec![a, b]).build().unwrap();
        assert_eq!(graph.dependencies(0), &[1]);
    }

    #[test]
    fn allow_scope_overlap_skips_inference() {
        let mut a = phase("01", &[]);
        a.scope = vec!["src/auth/*.rs".into()];
        a.allow_scope_overlap = true;
        let mut b = phase("02", &[]);
        b.scope = vec!["src/auth/*.rs".into()];
        let graph = DagBuilder::new(vec![a, b]).build().unwrap();
        assert!(graph.dependencies(0).is_empty());
        assert!(graph.dependencies(1).is_empty());
    }

    #[test]
    fn file_mention_infers_edge() {
        let mut a = phase("01", &[]);
        a.scope = vec!["src/auth.rs".into()];
        let mut b = phase("02", &[]);
        b.body = "Refactor usages of src/auth.rs once it lands".into();
        let graph = DagBuilder::new(vec![a, b]).build().unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
    }

    #[test]
    fn empty_scope_has_no_file_mention_inference() {
        let a = phase("01", &[]); // empty scope
        let mut b = phase("02", &[]);
        b.body = "mentions nothing relevant".into();
        let graph = DagBuilder::new(vec![a, b]).build().unwrap();
        assert!(graph.dependencies(1).is_empty());
    }

    #[test]
    fn impact_score_counts_transitive_downstream() {
        let phases = vec![
            phase("01", &[]),
            phase("02", &["01"]),
            phase("03", &["02"]),
        ];
        let graph = DagBuilder::new(phases).build().unwrap();
        assert_eq!(graph.impact_score(0), 2);
        assert_eq!(graph.impact_score(1), 1);
        assert_eq!(graph.impact_score(2), 0);
    }

    #[test]
    fn dependencies_satisfied_tracks_done_set() {
        let phases = vec![phase("01", &[]), phase("02", &["01"])];
        let graph = DagBuilder::new(phases).build().unwrap();
        let mut done = Set::new();
        assert!(graph.dependencies_satisfied(0, &done));
        assert!(!graph.dependencies_satisfied(1, &done));
        done.insert(0);
        assert!(graph.dependencies_satisfied(1, &done));
    }
}
