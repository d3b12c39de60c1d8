//! Phase tracker: in-memory in-flight/done/failed/speculative sets.
//!
//! A single exclusive lock guards all four sets plus the speculative
//! context map; every operation is O(1) and held only for the duration of
//! the mutation, matching the "small and held briefly" shared-resource
//! policy the rest of the crate follows.

pub mod git;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub use git::{GitCollaborator, Git2Collaborator};

/// Captured at speculative dispatch time; used to roll back on discard.
#[derive(Debug, Clone)]
pub struct SpeculativeContext {
    pub depends_on_phase_id: String,
    pub base_commit_sha: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerState {
    done: HashSet<String>,
    failed: HashSet<String>,
    in_flight: HashSet<String>,
    speculative: HashSet<String>,
    in_reviewer_stage: HashSet<String>,
    speculative_context: HashMap<String, SpeculativeContext>,
}

pub struct PhaseTracker {
    state: Mutex<TrackerState>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn mark_in_flight(&self, id: &str) {
        self.state.lock().unwrap().in_flight.insert(id.to_string());
    }

    pub fn mark_entering_reviewer_stage(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .in_reviewer_stage
            .insert(id.to_string());
    }

    pub fn mark_done(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(id);
        state.speculative.remove(id);
        state.in_reviewer_stage.remove(id);
        state.speculative_context.remove(id);
        state.done.insert(id.to_string());
    }

    pub fn mark_failed(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(id);
        state.speculative.remove(id);
        state.in_reviewer_stage.remove(id);
        state.speculative_context.remove(id);
        state.failed.insert(id.to_string());
    }

    pub fn mark_speculative(&self, id: &str, ctx: SpeculativeContext) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.insert(id.to_string());
        state.speculative.insert(id.to_string());
        state.speculative_context.insert(id.to_string(), ctx);
    }

    /// The dependency completed successfully: move the phase from
    /// speculative to confirmed in-flight. It continues running normally.
    pub fn confirm_speculative(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.speculative.remove(id);
        state.speculative_context.remove(id);
    }

    /// The dependency failed or was rejected: drop the phase back to
    /// pending (removed from every tracker set).
    pub fn discard_speculative(&self, id: &str) -> Option<SpeculativeContext> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(id);
        state.speculative.remove(id);
        state.in_reviewer_stage.remove(id);
        state.speculative_context.remove(id)
    }

    pub fn is_speculative(&self, id: &str) -> bool {
        self.state.lock().unwrap().speculative.contains(id)
    }

    pub fn is_in_reviewer_stage(&self, id: &str) -> bool {
        self.state.lock().unwrap().in_reviewer_stage.contains(id)
    }

    pub fn speculative_context(&self, id: &str) -> Option<SpeculativeContext> {
        self.state.lock().unwrap().speculative_context.get(id).cloned()
    }

    pub fn done(&self) -> HashSet<String> {
        self.state.lock().unwrap().done.clone()
    }

    pub fn failed(&self) -> HashSet<String> {
        self.state.lock().unwrap().failed.clone()
    }

    pub fn in_flight(&self) -> HashSet<String> {
        self.state.lock().unwrap().in_flight.clone()
    }

    pub fn speculative(&self) -> HashSet<String> {
        self.state.lock().unwrap().speculative.clone()
    }

    pub fn in_reviewer_stage(&self) -> HashSet<String> {
        self.state.lock().unwrap().in_reviewer_stage.clone()
    }
}
