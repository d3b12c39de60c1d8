//! Hooks and telemetry: an ordered set of callbacks the
//! coder-reviewer loop fires at cycle/task boundaries, plus two reference
//! hooks — an append-only JSON-lines telemetry sink and a best-effort
//! mirror to an external issue tracker.
//!
//! A hook is invoked in registration order, one at a time; a panicking hook
//! never aborts the loop or the hooks after it (each call is wrapped in
//! `catch_unwind`). Hooks are expected to be cheap — the loop awaits each
//! one in turn before moving to the next.

pub mod telemetry;

pub use telemetry::TelemetryHook;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::beads::{self, BeadUpdate, BeadsCollaborator};
use crate::review::ReviewFinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CycleStart,
    AgentDone,
    ReviewComplete,
    TaskSuccess,
    TaskFailed,
    TaskRefactored,
    FilterFixAttempt,
    FilterFixResult,
    CacheMetrics,
}

/// A single loop event. Most fields are only meaningful for a subset of
/// `kind`s; unused fields are left at their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub bead_id: String,
    pub cycle: u32,
    #[serde(default)]
    pub agent_role: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub filter_fix: Option<FilterFixInfo>,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, bead_id: impl Into<String>, cycle: u32) -> Self {
        Self {
            kind,
            bead_id: bead_id.into(),
            cycle,
            agent_role: None,
            result: None,
            findings: Vec::new(),
            filter_fix: None,
            err: None,
            message: None,
        }
    }

    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_findings(mut self, findings: Vec<ReviewFinding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_filter_fix(mut self, info: FilterFixInfo) -> Self {
        self.filter_fix = Some(info);
        self
    }

    pub fn with_err(mut self, err: impl Into<String>) -> Self {
        self.err = Some(err.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterFixInfo {
    pub check: String,
    pub attempt: u32,
    pub passed: bool,
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// Ordered hook registry. `emit` drives every registered hook in
/// registration order, isolating each call so one hook's panic can never
/// take down the loop or skip the hooks after it.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn emit(&self, event: &Event) {
        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let event = event.clone();
            let call = async move { hook.on_event(&event).await };
            if std::panic::AssertUnwindSafe(call).catch_unwind().await.is_err() {
                tracing::error!(bead_id = %event.bead_id, kind = ?event.kind, "hook panicked, isolating and continuing");
            }
        }
    }
}

/// Mirrors a subset of lifecycle events to an external issue tracker.
/// Best-effort: every call site in `beads` already logs and swallows
/// failures, so this hook never fails the loop.
pub struct BeadsHook {
    collaborator: Arc<dyn BeadsCollaborator>,
}

impl BeadsHook {
    pub fn new(collaborator: Arc<dyn BeadsCollaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl Hook for BeadsHook {
    async fn on_event(&self, event: &Event) {
        match event.kind {
            EventKind::TaskSuccess => {
                beads::update_best_effort(
                    self.collaborator.as_ref(),
                    &event.bead_id,
                    BeadUpdate {
                        status: Some("done".to_string()),
                        cost_usd: None,
                    },
                )
                .await;
                beads::close_best_effort(self.collaborator.as_ref(), &event.bead_id).await;
            }
            EventKind::TaskFailed => {
                let text = event.err.clone().unwrap_or_else(|| "phase failed".to_string());
                beads::add_comment_best_effort(self.collaborator.as_ref(), &event.bead_id, &text).await;
                beads::update_best_effort(
                    self.collaborator.as_ref(),
                    &event.bead_id,
                    BeadUpdate {
                        status: Some("failed".to_string()),
                        cost_usd: None,
                    },
                )
                .await;
            }
            EventKind::TaskRefactored => {
                let text = event
                    .message
                    .clone()
                    .unwrap_or_else(|| "task description was refactored mid-run".to_string());
                beads::add_comment_best_effort(self.collaborator.as_ref(), &event.bead_id, &text).await;
            }
            EventKind::ReviewComplete if !event.findings.is_empty() => {
                let summary = event
                    .findings
                    .iter()
                    .map(|f| format!("- [{}] {}", f.severity, f.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                beads::add_comment_best_effort(self.collaborator.as_ref(), &event.bead_id, &summary).await;
            }
            _ => {}
        }
    }
}
