//! Typed error hierarchy for the execution core.
//!
//! Three top-level enums cover the three subsystems named in the error
//! handling design: `DagError` for validation/inference failures,
//! `FabricError` for the coordination store, and `PhaseError` for a single
//! phase's coder-reviewer loop. Call sites outside the library use
//! `anyhow::Result` and `?`.

use thiserror::Error;

/// Errors raised while constructing or validating the phase DAG.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in phase dependencies. Involved phases: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that number exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),
}

/// Errors raised by the fabric coordination store.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("claim on {path} already held by {other_owner}")]
    ClaimHeld {
        path: String,
        other_owner: String,
    },

    #[error("archive refused: {0} claim(s) still held")]
    ActiveClaims(usize),

    #[error("archive refused: unresolved discoveries remain")]
    UnresolvedDiscoveries,

    #[error("fabric store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors raised by a single phase's coder-reviewer loop.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("budget exceeded: spent {spent_usd} of {budget_usd} after cycle {cycle}")]
    BudgetExceeded {
        spent_usd: f64,
        budget_usd: f64,
        cycle: u32,
    },

    #[error("max review cycles reached ({max_cycles})")]
    MaxCyclesReached { max_cycles: u32 },

    #[error("LLM invoker error: {0}")]
    InvokerError(#[source] anyhow::Error),

    #[error("filter check '{check}' failed after {attempts} fix attempt(s)")]
    FilterRecoverable { check: String, attempts: u32 },

    #[error("claim violation on {path}{}", .held_by.as_deref().map(|h| format!(" (held by {h})")).unwrap_or_default())]
    ClaimViolation {
        path: String,
        held_by: Option<String>,
    },

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Fabric(#[from] FabricError),
}

impl PhaseError {
    /// Whether this error is fatal to the phase (vs. recoverable by the
    /// inner fix loop or a retry cycle).
    pub fn is_fatal_to_phase(&self) -> bool {
        matches!(
            self,
            PhaseError::BudgetExceeded { .. } | PhaseError::MaxCyclesReached { .. }
        )
    }
}
