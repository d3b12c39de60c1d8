//! Hail queue: a non-blocking agent → human channel. A phase posts a
//! hail when it needs a decision it cannot make alone; the queue holds it
//! until a human resolves it or the configured timeout auto-resolves it.
//! Unlike the fabric, hails are process-local and not persisted — they exist
//! only to shape the next cycle's prompt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HailKind {
    DecisionNeeded,
    Ambiguity,
    Blocker,
    HumanReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hail {
    pub id: i64,
    pub phase_id: String,
    pub cycle: u32,
    pub source_role: String,
    pub kind: HailKind,
    pub summary: String,
    pub detail: String,
    pub options: Vec<String>,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub auto_resolved: bool,
}

impl Hail {
    fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

const TIMEOUT_MESSAGE: &str =
    "No human response was received before the configured timeout; proceeding on the agent's best judgment.";

/// Holds every hail ever posted for the life of a run. `unresolved` and the
/// per-phase prompt blocks only look at still-open entries; resolved ones
/// stay for the record.
pub struct HailQueue {
    next_id: AtomicI64,
    hails: Mutex<Vec<Hail>>,
    timeout: Duration,
}

impl HailQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            hails: Mutex::new(Vec::new()),
            timeout,
        }
    }

    pub async fn post(
        &self,
        phase_id: &str,
        cycle: u32,
        source_role: &str,
        kind: HailKind,
        summary: impl Into<String>,
        detail: impl Into<String>,
        options: Vec<String>,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let hail = Hail {
            id,
            phase_id: phase_id.to_string(),
            cycle,
            source_role: source_role.to_string(),
            kind,
            summary: summary.into(),
            detail: detail.into(),
            options,
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
            auto_resolved: false,
        };
        self.hails.lock().await.push(hail);
        id
    }

    pub async fn unresolved(&self) -> Vec<Hail> {
        self.hails
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_resolved())
            .cloned()
            .collect()
    }

    pub async fn unresolved_for_phase(&self, phase_id: &str) -> Vec<Hail> {
        self.hails
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_resolved() && h.phase_id == phase_id)
            .cloned()
            .collect()
    }

    pub async fn resolve(&self, id: i64, text: impl Into<String>) -> bool {
        let mut hails = self.hails.lock().await;
        let Some(hail) = hails.iter_mut().find(|h| h.id == id) else {
            return false;
        };
        if hail.is_resolved() {
            return false;
        }
        hail.resolution = Some(text.into());
        hail.resolved_at = Some(Utc::now());
        true
    }

    /// Auto-resolves every hail older than the configured timeout with a
    /// standard message. `0` disables the timeout (waits indefinitely). Call
    /// this once per dispatch tick; it is idempotent for already-resolved
    /// entries.
    pub async fn sweep_timeouts(&self) -> Vec<i64> {
        if self.timeout.is_zero() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut resolved_ids = Vec::new();
        let mut hails = self.hails.lock().await;
        for hail in hails.iter_mut() {
            if hail.is_resolved() {
                continue;
            }
            let age = now.signed_duration_since(hail.created_at);
            let timeout_secs = self.timeout.as_secs() as i64;
            if age.num_seconds() >= timeout_secs {
                hail.resolution = Some(TIMEOUT_MESSAGE.to_string());
                hail.resolved_at = Some(now);
                hail.auto_resolved = true;
                resolved_ids.push(hail.id);
            }
        }
        resolved_ids
    }

    /// The prompt block for a given phase's next cycle: an unresolved hail
    /// becomes `[HAIL TIMEOUT]` if it auto-resolved, otherwise the most
    /// recently resolved hail for this phase becomes `[HAIL RELAY]`. `None`
    /// when there is nothing to relay.
    pub async fn prompt_block_for(&self, phase_id: &str) -> Option<String> {
        let hails = self.hails.lock().await;
        let mut relevant: Vec<&Hail> = hails.iter().filter(|h| h.phase_id == phase_id).collect();
        relevant.sort_by_key(|h| h.created_at);
        let latest_resolved = relevant.iter().rev().find(|h| h.is_resolved())?;

        if latest_resolved.auto_resolved {
            Some(format!(
                "[HAIL TIMEOUT]\n{}\nResolution: {}",
                latest_resolved.summary,
                latest_resolved.resolution.as_deref().unwrap_or(""),
            ))
        } else {
            Some(format!(
                "[HAIL RELAY]\n{}\nResolution: {}",
                latest_resolved.summary,
                latest_resolved.resolution.as_deref().unwrap_or(""),
            ))
        }
    }
}
