//! Beads collaborator: an optional external issue tracker the loop
//! mirrors lifecycle events to. Failures are logged, never fatal — the
//! trait returns `anyhow::Result` but every call site in this crate treats
//! an `Err` as a log line, not a propagated failure.

use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct BeadUpdate {
    pub status: Option<String>,
    pub cost_usd: Option<f64>,
}

#[async_trait]
pub trait BeadsCollaborator: Send + Sync {
    async fn add_comment(&self, bead_id: &str, text: &str) -> anyhow::Result<()>;
    async fn update(&self, bead_id: &str, update: BeadUpdate) -> anyhow::Result<()>;
    async fn close(&self, bead_id: &str) -> anyhow::Result<()>;
}

/// Calls the configured collaborator and logs (never propagates) failures,
/// matching the best-effort contract hook callers rely on.
pub async fn add_comment_best_effort(
    collaborator: &dyn BeadsCollaborator,
    bead_id: &str,
    text: &str,
) {
    if let Err(err) = collaborator.add_comment(bead_id, text).await {
        tracing::warn!(bead_id, error = %err, "beads add_comment failed");
    }
}

pub async fn update_best_effort(
    collaborator: &dyn BeadsCollaborator,
    bead_id: &str,
    update: BeadUpdate,
) {
    if let Err(err) = collaborator.update(bead_id, update).await {
        tracing::warn!(bead_id, error = %err, "beads update failed");
    }
}

pub async fn close_best_effort(collaborator: &dyn BeadsCollaborator, bead_id: &str) {
    if let Err(err) = collaborator.close(bead_id).await {
        tracing::warn!(bead_id, error = %err, "beads close failed");
    }
}

/// No-op collaborator used when no tracker is configured.
pub struct NoopBeads;

#[async_trait]
impl BeadsCollaborator for NoopBeads {
    async fn add_comment(&self, _bead_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn update(&self, _bead_id: &str, _update: BeadUpdate) -> anyhow::Result<()> {
        Ok(())
    }
    async fn close(&self, _bead_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
