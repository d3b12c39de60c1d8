//! Fabric row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fast-read phase state, distinct from the persisted runtime status
/// (`pending|in_progress|speculative|done|failed|skipped`) — this is what
/// the fabric tracks for other phases to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Queued,
    Scanning,
    Running,
    Speculative,
    Blocked,
    Done,
    Failed,
    HumanDecisionRequired,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Scanning => "SCANNING",
            Self::Running => "RUNNING",
            Self::Speculative => "SPECULATIVE",
            Self::Blocked => "BLOCKED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::HumanDecisionRequired => "HUMAN_DECISION_REQUIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => Self::Queued,
            "SCANNING" => Self::Scanning,
            "RUNNING" => Self::Running,
            "SPECULATIVE" => Self::Speculative,
            "BLOCKED" => Self::Blocked,
            "DONE" => Self::Done,
            "FAILED" => Self::Failed,
            "HUMAN_DECISION_REQUIRED" => Self::HumanDecisionRequired,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntanglementKind {
    Type,
    Function,
    Interface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntanglementStatus {
    Pending,
    Fulfilled,
    Disputed,
}

impl EntanglementStatus {
    /// Whether moving from `self` to `next` is a legal transition: monotonic
    /// `pending -> fulfilled`, or `pending|fulfilled -> disputed`. Staying put
    /// is always legal; anything else (`fulfilled -> pending`, or leaving
    /// `disputed`) is not.
    pub fn can_transition_to(self, next: EntanglementStatus) -> bool {
        use EntanglementStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Fulfilled) => true,
            (Pending, Disputed) => true,
            (Fulfilled, Disputed) => true,
            _ => false,
        }
    }
}

/// A produce/consume contract on a named interface symbol. Unique on
/// `(producer, name, kind)`; `consumer = None` means "any consumer" (`*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entanglement {
    pub id: i64,
    pub producer: String,
    pub consumer: Option<String>,
    pub kind: EntanglementKind,
    pub name: String,
    pub signature: String,
    pub package: String,
    pub status: EntanglementStatus,
}

/// An advisory lock on a single file path. Primary key is `path`: exactly
/// one owner at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileClaim {
    pub path: String,
    pub owner_task: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    FileConflict,
    RequirementsAmbiguity,
    BudgetAlert,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub id: i64,
    pub source_task: String,
    pub kind: DiscoveryKind,
    pub detail: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseKind {
    Note,
    ReviewerFeedback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub id: i64,
    pub task_id: String,
    pub content: String,
    pub kind: PulseKind,
    pub created_at: DateTime<Utc>,
}
