//! Phase spec: the immutable per-run descriptor for a single coding task.
//!
//! A nebula is a manifest plus an ordered set of these specs. The core never
//! mutates a `PhaseSpec` after load; runtime state lives alongside it in the
//! phase tracker (see [`crate::tracker`]) and the fabric.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::gater::GateMode;

/// Immutable per-run descriptor for a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Unique id within the nebula (e.g. "01", "02").
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Markdown task description shown to the coder.
    pub body: String,
    /// Phase ids that must be `done` before this phase is eligible.
    #[serde(default)]
    pub depends_on: HashSet<String>,
    /// Reverse dependencies: phases that depend on this one. Expanded into
    /// `depends_on` on the named phases during dependency inference.
    #[serde(default)]
    pub blocks: HashSet<String>,
    /// Glob patterns describing files this phase may modify. An empty scope
    /// means "no scope": no scope-based exclusion, no file-mention inference.
    #[serde(default)]
    pub scope: Vec<String>,
    /// When true, this phase is exempt from scope-overlap exclusion against
    /// other `allow_scope_overlap` phases.
    #[serde(default)]
    pub allow_scope_overlap: bool,
    /// Dispatch priority; lower values dispatch first on ties.
    #[serde(default)]
    pub priority: i64,
    /// Maximum coder-reviewer cycles before failing with `MaxCyclesReached`.
    pub max_review_cycles: u32,
    /// Total budget in USD for the phase across all cycles. 0 disables the
    /// budget check.
    #[serde(default)]
    pub max_budget_usd: f64,
    /// Model identifier passed through to the LLM invoker.
    pub model: String,
    /// Gate strategy applied at this phase's boundaries.
    #[serde(default)]
    pub gate: GateMode,
    /// Per-phase override of the nebula-wide `speculative` setting. `None`
    /// inherits the nebula default.
    #[serde(default)]
    pub speculative: Option<bool>,
}

impl PhaseSpec {
    /// Whether this phase's scope overlaps another's, per glob intersection.
    /// Two phases with no scope never overlap (empty scope means "no
    /// scope").
    pub fn scope_overlaps(&self, other: &PhaseSpec) -> bool {
        if self.scope.is_empty() || other.scope.is_empty() {
            return false;
        }
        self.scope
            .iter()
            .any(|a| other.scope.iter().any(|b| glob_patterns_overlap(a, b)))
    }

    /// Whether speculative dispatch is enabled for this phase, given the
    /// nebula-wide default.
    pub fn speculative_enabled(&self, nebula_default: bool) -> bool {
        self.speculative.unwrap_or(nebula_default)
    }
}

/// Conservative overlap check between two glob patterns: true if they share
/// a literal prefix up to the first wildcard, or either is a superset
/// pattern (`**`, `*`) of the other's directory.
fn glob_patterns_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let a_prefix = literal_prefix(a);
    let b_prefix = literal_prefix(b);
    a_prefix.starts_with(&b_prefix) || b_prefix.starts_with(&a_prefix)
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?', '[']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

/// The full nebula manifest: a run identity plus its ordered phase specs.
/// On-disk manifest *parsing* is out of scope; this is the shape the core
/// consumes once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nebula {
    pub epoch_id: String,
    pub phases: Vec<PhaseSpec>,
    /// Nebula-wide speculative default; phases may override via
    /// `PhaseSpec::speculative`.
    #[serde(default)]
    pub speculative: bool,
}
