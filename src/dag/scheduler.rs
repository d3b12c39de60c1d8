//! Scheduler/eligibility: waves, tracks, impact ordering, and the two
//! resolve queries the worker group ticks against.

use crate::dag::builder::{PhaseGraph, PhaseIndex};
use crate::phase::PhaseSpec;
use std::collections::HashSet;

/// Kahn-style breadth layers: wave k holds phases whose dependencies all lie
/// in waves < k. Deterministic ordering only; dispatch is not wave-gated.
pub fn waves(graph: &PhaseGraph) -> Vec<Vec<PhaseIndex>> {
    let n = graph.len();
    let mut remaining: HashSet<PhaseIndex> = (0..n).collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let mut wave: Vec<PhaseIndex> = remaining
            .iter()
            .copied()
            .filter(|&i| graph.dependencies(i).iter().all(|d| !remaining.contains(d)))
            .collect();
        if wave.is_empty() {
            // Cycle; builder validation should have already caught this.
            break;
        }
        wave.sort_unstable();
        for &i in &wave {
            remaining.remove(&i);
        }
        waves.push(wave);
    }
    waves
}

/// Weakly-connected components of the DAG after removing edges that cross
/// into phases in `done`. Used for UI/reporting, not dispatch.
pub fn tracks(graph: &PhaseGraph, done: &HashSet<PhaseIndex>) -> Vec<Vec<PhaseIndex>> {
    let n = graph.len();
    let mut visited = vec![false; n];
    let mut components = Vec::new();

    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        visited[start] = true;
        while let Some(node) = stack.pop() {
            component.push(node);
            let neighbors = graph
                .dependents(node)
                .iter()
                .chain(graph.dependencies(node).iter())
                .copied();
            for neighbor in neighbors {
                if done.contains(&neighbor) || done.contains(&node) {
                    continue;
                }
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components.sort_by_key(|c| c.first().copied().unwrap_or(0));
    components
}

/// Snapshot of tracker state the scheduler consults to compute eligibility.
/// A thin view so the scheduler doesn't depend on the tracker's lock shape.
pub struct TrackerSnapshot<'a> {
    pub done: &'a HashSet<PhaseIndex>,
    pub failed: &'a HashSet<PhaseIndex>,
    pub in_flight: &'a HashSet<PhaseIndex>,
    pub speculative: &'a HashSet<PhaseIndex>,
    /// Phases currently in flight whose loop has reached the reviewer stage.
    pub in_reviewer_stage: &'a HashSet<PhaseIndex>,
}

/// Phases eligible for confirmed dispatch: not in any tracker set, all
/// deps done. Sorted impact desc, priority asc, id asc.
pub fn resolve_eligible(graph: &PhaseGraph, tracker: &TrackerSnapshot) -> Vec<PhaseIndex> {
    let mut eligible: Vec<PhaseIndex> = (0..graph.len())
        .filter(|&i| {
            !tracker.done.contains(&i)
                && !tracker.failed.contains(&i)
                && !tracker.in_flight.contains(&i)
                && !tracker.speculative.contains(&i)
                && graph.dependencies_satisfied(i, tracker.done)
        })
        .collect();
    sort_by_dispatch_order(graph, &mut eligible);
    eligible
}

/// Phases eligible for speculative dispatch: exactly one unsatisfied dep,
/// that dep in-flight and in its reviewer stage. Only called when the
/// caller has already confirmed speculative dispatch is enabled for the
/// nebula/phase.
pub fn resolve_speculative(
    graph: &PhaseGraph,
    tracker: &TrackerSnapshot,
) -> Vec<(PhaseIndex, PhaseIndex)> {
    let mut out = Vec::new();
    for i in 0..graph.len() {
        if tracker.done.contains(&i)
            || tracker.failed.contains(&i)
            || tracker.in_flight.contains(&i)
            || tracker.speculative.contains(&i)
        {
            continue;
        }
        let unsatisfied: Vec<PhaseIndex> = graph
            .dependencies(i)
            .iter()
            .copied()
            .filter(|d| !tracker.done.contains(d))
            .collect();
        if unsatisfied.len() != 1 {
            continue;
        }
        let dep = unsatisfied[0];
        if tracker.in_flight.contains(&dep) && tracker.in_reviewer_stage.contains(&dep) {
            out.push((i, dep));
        }
    }
    out.sort_by_key(|&(i, _)| i);
    out
}

fn sort_by_dispatch_order(graph: &PhaseGraph, candidates: &mut [PhaseIndex]) {
    candidates.sort_by(|&a, &b| {
        let pa = graph.get_phase(a).expect("valid index");
        let pb = graph.get_phase(b).expect("valid index");
        graph
            .impact_score(b)
            .cmp(&graph.impact_score(a))
            .then(pa.priority.cmp(&pb.priority))
            .then(pa.id.cmp(&pb.id))
    });
}

/// Per-phase eligibility check used when a caller already has a single
/// `PhaseSpec` and needs to know if its scope conflicts with a set of
/// currently-running phases.
pub fn scope_conflicts_with_running(candidate: &PhaseSpec, running: &[&PhaseSpec]) -> bool {
    running.iter().any(|p| candidate.scope_overlaps(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::DagBuilder;
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

    fn diamond() -> PhaseGraph {
        let phases = vec![
            phase("01", &[]),
            phase("02", &["01"]),
            phase("03", &["01"]),
            phase("04", &["02", "03"]),
        ];
        DagBuilder::new(phases).build().unwrap()
    }

    #[test]
    fn waves_groups_diamond_into_three_layers() {
        let graph = diamond();
        let result = waves(&graph);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], vec![0]);
        assert_eq!(result[1], vec![1, 2]);
        assert_eq!(result[2], vec![3]);
    }

    #[test]
    fn resolve_eligible_returns_only_root_initially() {
        let graph = diamond();
        let done = Set::new();
        let failed = Set::new();
        let in_flight = Set::new();
        let speculative = Set::new();
        let in_reviewer_stage = Set::new();
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        assert_eq!(resolve_eligible(&graph, &tracker), vec![0]);
    }

    #[test]
    fn resolve_eligible_unlocks_both_middle_phases_after_root_done() {
        let graph = diamond();
        let mut done = Set::new();
        done.insert(0);
        let failed = Set::new();
        let in_flight = Set::new();
        let speculative = Set::new();
        let in_reviewer_stage = Set::new();
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        let eligible = resolve_eligible(&graph, &tracker);
        assert_eq!(eligible.len(), 2);
        assert!(eligible.contains(&1));
        assert!(eligible.contains(&2));
    }

    #[test]
    fn resolve_speculative_requires_single_unsatisfied_dep_in_reviewer_stage() {
        let graph = diamond();
        let done = Set::new();
        let failed = Set::new();
        let mut in_flight = Set::new();
        in_flight.insert(0);
        let speculative = Set::new();
        let mut in_reviewer_stage = Set::new();
        in_reviewer_stage.insert(0);
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        let result = resolve_speculative(&graph, &tracker);
        assert_eq!(result, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn resolve_speculative_excludes_phases_with_multiple_unsatisfied_deps() {
        let graph = diamond();
        let done = Set::new();
        let failed = Set::new();
        let mut in_flight = Set::new();
        in_flight.insert(1);
        in_flight.insert(2);
        let speculative = Set::new();
        let mut in_reviewer_stage = Set::new();
        in_reviewer_stage.insert(1);
        in_reviewer_stage.insert(2);
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        // phase 3 (index 3) has two unsatisfied deps (1 and 2): excluded.
        let result = resolve_speculative(&graph, &tracker);
        assert!(result.is_empty());
    }

    #[test]
    fn resolve_speculative_requires_reviewer_stage_not_just_in_flight() {
        let graph = diamond();
        let done = Set::new();
        let failed = Set::new();
        let mut in_flight = Set::new();
        in_flight.insert(0);
        let speculative = Set::new();
        let in_reviewer_stage = Set::new(); // dep 0 in flight but not reviewing yet
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        assert!(resolve_speculative(&graph, &tracker).is_empty());
    }

    #[test]
    fn eligible_excludes_done_failed_in_flight_and_speculative() {
        let graph = diamond();
        let mut done = Set::new();
        done.insert(0);
        let mut failed = Set::new();
        failed.insert(1);
        let mut in_flight = Set::new();
        in_flight.insert(2);
        let speculative = Set::new();
        let in_reviewer_stage = Set::new();
        let tracker = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        // only phase 3 has deps (1, 2) neither done; nothing eligible.
        assert!(resolve_eligible(&graph, &tracker).is_empty());
    }

    #[test]
    fn scope_conflict_detection_uses_phase_scope_overlap() {
        let mut a = phase("01", &[]);
        a.scope = vec!["src/auth/*.rs".into()];
        let mut b = phase("02", &[]);
        b.scope = vec!["src/auth/login.rs".into()];
        assert!(scope_conflicts_with_running(&b, &[&a]));

        let mut c = phase("03", &[]);
        c.scope = vec!["src/billing/*.rs".into()];
        assert!(!scope_conflicts_with_running(&c, &[&a]));
    }
}
