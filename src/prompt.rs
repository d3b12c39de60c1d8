//! Prompt layout and cache identity.
//!
//! The system prompt is computed once per phase and held by value; rebuilding
//! it per cycle is a cache-invalidation bug. The user prompt is rebuilt
//! every cycle from the current `CycleState`.

use sha2::{Digest, Sha256};

use crate::cycle::CycleState;
use crate::fabric::{Discovery, Entanglement, EntanglementKind, EntanglementStatus, Fabric, Pulse};
use crate::review::{FindingStatus, ReviewFinding};

/// `role` as passed to the LLM invoker (`"coder"` or `"reviewer"`).
pub fn base_prompt(role: &str) -> String {
    match role {
        "reviewer" => {
            "You are the reviewer in a coder-reviewer loop. Examine the coder's \
             changes against the task description. Respond with `APPROVED:` if the \
             work is complete and correct, or one `ISSUE: <severity> <description>` \
             line per defect found. When verifying findings from a prior cycle, emit \
             `VERIFICATION: id=<id> status=<fixed|still_present|regressed>` lines."
                .to_string()
        }
        _ => "You are the coder in a coder-reviewer loop. Implement the task \
              description exactly; do not invent scope beyond it."
            .to_string(),
    }
}

const FABRIC_PROTOCOL: &str = "\
Fabric protocol: you may read entanglements, claims, discoveries, and pulses \
published by other in-flight phases. Publish an entanglement when you define \
an interface another phase is expected to consume. Claim a file before \
editing it outside your declared scope. Post a discovery if you find a \
conflict or ambiguity you cannot resolve alone.";

/// Builds the stable system prompt once per phase: `ProjectContext ||
/// BasePrompt(role) || FabricProtocol`. Byte-identical across cycles of the
/// same phase.
pub fn build_system_prompt(project_context: &str, role: &str) -> String {
    format!("{project_context}\n\n{}\n\n{FABRIC_PROTOCOL}", base_prompt(role))
}

/// Renders a fabric snapshot section for the volatile user prompt: every
/// entanglement, unresolved discovery, and pulse currently published,
/// so a phase's coder/reviewer can see what concurrently running phases
/// have claimed or negotiated. Returns an empty string when the fabric has
/// nothing to report, so callers can omit the section entirely.
pub async fn build_fabric_snapshot(fabric: &Fabric) -> String {
    let entanglements = fabric.all_entanglements().await.unwrap_or_default();
    let discoveries = fabric.unresolved_discoveries().await.unwrap_or_default();
    let pulses = fabric.all_pulses().await.unwrap_or_default();

    if entanglements.is_empty() && discoveries.is_empty() && pulses.is_empty() {
        return String::new();
    }

    let mut block = String::from("## Fabric snapshot\n");

    if !entanglements.is_empty() {
        block.push_str("### Entanglements\n");
        for e in &entanglements {
            block.push_str(&format!(
                "- {} {} `{}` ({}) [{}]\n",
                entanglement_kind_str(e.kind),
                e.name,
                e.signature,
                e.producer,
                entanglement_status_str(e.status),
            ));
        }
    }

    if !discoveries.is_empty() {
        block.push_str("### Unresolved discoveries\n");
        for d in &discoveries {
            block.push_str(&format!("- ({}) {}: {}\n", d.source_task, discovery_kind_str(d), d.detail));
        }
    }

    if !pulses.is_empty() {
        block.push_str("### Pulses\n");
        for p in &pulses {
            block.push_str(&format!("- [{}] {}: {}\n", p.task_id, pulse_kind_str(p), p.content));
        }
    }

    block
}

fn entanglement_kind_str(kind: EntanglementKind) -> &'static str {
    match kind {
        EntanglementKind::Type => "type",
        EntanglementKind::Function => "function",
        EntanglementKind::Interface => "interface",
    }
}

fn entanglement_status_str(status: EntanglementStatus) -> &'static str {
    match status {
        EntanglementStatus::Pending => "pending",
        EntanglementStatus::Fulfilled => "fulfilled",
        EntanglementStatus::Disputed => "disputed",
    }
}

fn discovery_kind_str(d: &Discovery) -> &'static str {
    use crate::fabric::DiscoveryKind::*;
    match d.kind {
        FileConflict => "file_conflict",
        RequirementsAmbiguity => "requirements_ambiguity",
        BudgetAlert => "budget_alert",
        Other => "other",
    }
}

fn pulse_kind_str(p: &Pulse) -> &'static str {
    use crate::fabric::PulseKind::*;
    match p.kind {
        Note => "note",
        ReviewerFeedback => "reviewer_feedback",
    }
}

/// Builds the volatile user prompt for the current cycle. `fabric_snapshot`
/// is the pre-rendered block from [`build_fabric_snapshot`] (empty/`None`
/// when fabric coordination has nothing to report).
pub fn build_user_prompt(
    state: &CycleState,
    hail_block: Option<&str>,
    fabric_snapshot: Option<&str>,
) -> String {
    let mut sections = Vec::new();

    if state.refactored {
        sections.push(format!(
            "[REFACTOR — USER UPDATE]\nBefore: {}\nAfter: {}",
            state.original_description.as_deref().unwrap_or(""),
            state.task_description
        ));
    }

    sections.push(format!("## Task: {}\n{}", state.task_title, state.task_description));

    if state.cycle > 1 {
        let open: Vec<&ReviewFinding> = state
            .all_findings
            .iter()
            .filter(|f| f.status != FindingStatus::Fixed)
            .collect();
        if !open.is_empty() {
            let mut block = String::from("## Open findings from prior cycles\n");
            for finding in open {
                block.push_str(&format!(
                    "- [{}] ({}) {}\n",
                    finding.severity, finding.id, finding.description
                ));
            }
            sections.push(block);
        }
    }

    if let Some(output) = &state.coder_output {
        sections.push(format!("## Coder output\n{output}"));
    }
    if let Some(output) = &state.review_output {
        sections.push(format!("## Reviewer output\n{output}"));
    }
    if let Some(output) = &state.filter_output {
        sections.push(format!(
            "## Filter output ({})\n{output}",
            state.filter_check_name.as_deref().unwrap_or("unknown")
        ));
    }
    if let Some(hail_block) = hail_block {
        sections.push(hail_block.to_string());
    }
    if let Some(fabric_snapshot) = fabric_snapshot
        && !fabric_snapshot.is_empty()
    {
        sections.push(fabric_snapshot.to_string());
    }

    sections.join("\n\n")
}

/// Recorded per invocation; used to derive the cache hit/miss signal.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub system_prompt_len: usize,
    pub user_prompt_len: usize,
    pub system_prompt_hash: String,
}

impl InvocationResult {
    pub fn new(system_prompt: &str, user_prompt: &str) -> Self {
        Self {
            system_prompt_len: system_prompt.len(),
            user_prompt_len: user_prompt.len(),
            system_prompt_hash: hex::encode(Sha256::digest(system_prompt.as_bytes())),
        }
    }

    /// A cache hit when `prev_hash` (the previous cycle's recorded hash for
    /// the same phase) matches this invocation's hash.
    pub fn is_cache_hit(&self, prev_hash: Option<&str>) -> bool {
        prev_hash == Some(self.system_prompt_hash.as_str())
    }
}
