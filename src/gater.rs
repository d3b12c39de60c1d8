//! Gate strategy applied between phase boundaries.
//!
//! The four gate modes are a closed set: modeled as a tagged enum with an
//! `apply` operation rather than an open trait hierarchy, per the design
//! note against dynamic dispatch for closed variant sets.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Gate strategy decided at nebula load, optionally overridden per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Always proceed without pausing.
    #[default]
    Trust,
    /// Emit a review request and wait for acknowledgement before the next
    /// phase.
    Review,
    /// Block on an explicit human approve/reject/skip response.
    Approve,
    /// Stream progress; never blocks.
    Watch,
}

/// A request sent to whatever surface presents gate decisions to a human.
/// The core only produces this value and waits on `reply`; rendering it is
/// out of scope.
#[derive(Debug)]
pub struct GateRequest {
    pub phase_id: String,
    pub boundary: GateBoundary,
    pub summary: String,
    pub reply: oneshot::Sender<GateResponse>,
}

/// Where in a phase's lifecycle a gate check occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBoundary {
    /// Between two phases (all modes).
    PhaseBoundary,
    /// Between coder-reviewer cycles within a phase (`approve` only).
    CycleBoundary,
}

/// Human response to a `GateRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResponse {
    Approve,
    Reject,
    Skip,
}

/// Outcome of applying a gate at a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    Reject,
    Skip,
}

/// Channel used to present gate requests to a human surface and receive a
/// decision. `None` means no human surface is attached, in which case
/// `approve`/`review` degrade to `Proceed` (best-effort, matching "hooks
/// must not block long" in spirit — a gate with no attached surface cannot
/// block forever).
pub type GateSink = tokio::sync::mpsc::Sender<GateRequest>;

impl GateMode {
    /// Apply this gate strategy at the given boundary. `approve` only
    /// blocks at `CycleBoundary` when the nebula configured per-cycle
    /// approval; callers pass `None` for `sink` to mean "no approval
    /// surface attached".
    pub async fn apply(
        self,
        phase_id: &str,
        boundary: GateBoundary,
        summary: String,
        sink: Option<&GateSink>,
    ) -> GateOutcome {
        match self {
            GateMode::Trust => GateOutcome::Proceed,
            GateMode::Watch => GateOutcome::Proceed,
            GateMode::Review => {
                if let Some(sink) = sink {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let request = GateRequest {
                        phase_id: phase_id.to_string(),
                        boundary,
                        summary,
                        reply: reply_tx,
                    };
                    if sink.send(request).await.is_ok()
                        && let Ok(response) = reply_rx.await
                    {
                        return response.into();
                    }
                }
                GateOutcome::Proceed
            }
            GateMode::Approve => {
                if boundary == GateBoundary::CycleBoundary && sink.is_none() {
                    return GateOutcome::Proceed;
                }
                if let Some(sink) = sink {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let request = GateRequest {
                        phase_id: phase_id.to_string(),
                        boundary,
                        summary,
                        reply: reply_tx,
                    };
                    if sink.send(request).await.is_ok()
                        && let Ok(response) = reply_rx.await
                    {
                        return response.into();
                    }
                }
                GateOutcome::Proceed
            }
        }
    }
}

impl From<GateResponse> for GateOutcome {
    fn from(response: GateResponse) -> Self {
        match response {
            GateResponse::Approve => GateOutcome::Proceed,
            GateResponse::Reject => GateOutcome::Reject,
            GateResponse::Skip => GateOutcome::Skip,
        }
    }
}
