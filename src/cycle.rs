//! The per-phase coder-reviewer loop: the state machine a worker
//! drives once per dispatched phase, cycling coder invoke → filter chain →
//! inner fix loop → reviewer invoke → finding verification until approval,
//! the cycle ceiling, or a fatal filter/budget failure.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::NebulaConfig;
use crate::errors::PhaseError;
use crate::fabric::Fabric;
use crate::filter::{self, ClaimsContext, FilterCommands};
use crate::hail::HailQueue;
use crate::hooks::{Event, EventKind, FilterFixInfo, HookRegistry};
use crate::invoker::{AgentSpec, InvocationOutcome, LlmInvoker};
use crate::phase::PhaseSpec;
use crate::prompt::{self, InvocationResult};
use crate::review::{
    self, FindingSeverity, ReviewFinding, ReviewReport, Verification, apply_verifications,
};
use crate::tracker::git::GitCollaborator;

/// Tools the inner fix loop grants the coder: no shell, no arbitrary command
/// execution, just the file-editing surface.
const FIX_LOOP_TOOLS: &[&str] = &["read", "edit", "write", "glob"];

/// Mutable per-phase, per-run state threaded through every cycle. Exactly
/// the fields `prompt::build_user_prompt` reads.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub task_bead_id: String,
    pub task_title: String,
    pub task_description: String,
    pub cycle: u32,
    pub total_cost_usd: f64,
    pub coder_output: Option<String>,
    pub review_output: Option<String>,
    /// Findings raised in the current cycle.
    pub findings: Vec<ReviewFinding>,
    /// Every finding raised across all cycles so far, status kept current.
    pub all_findings: Vec<ReviewFinding>,
    pub verifications: Vec<Verification>,
    pub filter_output: Option<String>,
    pub filter_check_name: Option<String>,
    pub filter_fix_attempts: u32,
    pub filter_fix_cost_usd: f64,
    pub prev_system_prompt_hash: Option<String>,
    pub refactored: bool,
    pub original_description: Option<String>,
    pub refactor_description: Option<String>,
}

impl CycleState {
    pub fn new(phase: &PhaseSpec) -> Self {
        Self {
            task_bead_id: phase.id.clone(),
            task_title: phase.title.clone(),
            task_description: phase.body.clone(),
            cycle: 1,
            total_cost_usd: 0.0,
            coder_output: None,
            review_output: None,
            findings: Vec::new(),
            all_findings: Vec::new(),
            verifications: Vec::new(),
            filter_output: None,
            filter_check_name: None,
            filter_fix_attempts: 0,
            filter_fix_cost_usd: 0.0,
            prev_system_prompt_hash: None,
            refactored: false,
            original_description: None,
            refactor_description: None,
        }
    }

    /// Applies a mid-run refactor: the first refactor records the pristine
    /// description, later ones only update the current one. Findings and
    /// cycle count are not reset.
    fn apply_refactor(&mut self, new_description: String) {
        if self.original_description.is_none() {
            self.original_description = Some(self.task_description.clone());
        }
        self.task_description = new_description.clone();
        self.refactor_description = Some(new_description);
        self.refactored = true;
    }
}

/// Outcome of a phase's full coder-reviewer loop.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub approved: bool,
    pub cycles_used: u32,
    pub total_cost_usd: f64,
    pub report: Option<ReviewReport>,
    pub cache_hit_count: u32,
    pub cache_miss_count: u32,
    /// Bytes of system prompt reused on cache hits (sum of `system_prompt_len`
    /// over every cycle whose prompt hash matched the prior cycle's).
    pub total_cached_bytes: u64,
}

/// Drives the coder-reviewer loop for a single phase. The system prompts
/// are computed once at construction and held byte-identical across cycles.
pub struct CycleRunner {
    phase: PhaseSpec,
    config: NebulaConfig,
    invoker: Arc<dyn LlmInvoker>,
    git: Option<Arc<tokio::sync::Mutex<dyn GitCollaborator>>>,
    fabric: Arc<Fabric>,
    filter_commands: FilterCommands,
    coder_system_prompt: String,
    reviewer_system_prompt: String,
    hail: Option<Arc<HailQueue>>,
    on_reviewer_stage: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    hooks: HookRegistry,
}

impl CycleRunner {
    pub fn new(
        phase: PhaseSpec,
        config: NebulaConfig,
        project_context: &str,
        invoker: Arc<dyn LlmInvoker>,
        git: Option<Arc<tokio::sync::Mutex<dyn GitCollaborator>>>,
        fabric: Arc<Fabric>,
        filter_commands: FilterCommands,
    ) -> Self {
        let coder_system_prompt = prompt::build_system_prompt(project_context, "coder");
        let reviewer_system_prompt = prompt::build_system_prompt(project_context, "reviewer");
        Self {
            phase,
            config,
            invoker,
            git,
            fabric,
            filter_commands,
            coder_system_prompt,
            reviewer_system_prompt,
            hail: None,
            on_reviewer_stage: None,
            hooks: HookRegistry::new(),
        }
    }

    /// Attaches a hail queue so the next cycle's prompts relay any
    /// timed-out or just-resolved hail targeting this phase.
    pub fn with_hail(mut self, hail: Arc<HailQueue>) -> Self {
        self.hail = Some(hail);
        self
    }

    /// Attaches the hook registry the worker group shares across every
    /// phase's loop.
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attaches a callback fired the moment this phase's loop reaches the
    /// reviewer stage of a cycle, for the first time or again each cycle.
    /// The worker group uses this to mark the phase's reviewer-stage flag
    /// in the tracker, which gates speculative dispatch of its dependents.
    pub fn with_reviewer_stage_callback(mut self, callback: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_reviewer_stage = Some(callback);
        self
    }

    async fn hail_block(&self) -> Option<String> {
        let hail = self.hail.as_ref()?;
        hail.sweep_timeouts().await;
        hail.prompt_block_for(&self.phase.id).await
    }

    /// Renders the current fabric snapshot for the volatile user prompt;
    /// empty when the fabric has nothing published.
    async fn fabric_snapshot(&self) -> String {
        prompt::build_fabric_snapshot(&self.fabric).await
    }

    fn check_budget(&self, state: &CycleState) -> Result<(), PhaseError> {
        let budget = if self.phase.max_budget_usd > 0.0 {
            self.phase.max_budget_usd
        } else {
            self.config.max_budget_usd
        };
        if budget > 0.0 && state.total_cost_usd > budget {
            return Err(PhaseError::BudgetExceeded {
                spent_usd: state.total_cost_usd,
                budget_usd: budget,
                cycle: state.cycle,
            });
        }
        Ok(())
    }

    async fn invoke(
        &self,
        role: &str,
        system_prompt: &str,
        user_prompt: &str,
        allowed_tools: &[&str],
        work_dir: &Path,
    ) -> Result<(InvocationOutcome, InvocationResult), PhaseError> {
        let agent = AgentSpec {
            role: role.to_string(),
            system_prompt: system_prompt.to_string(),
            model: self.phase.model.clone(),
            max_budget_usd: self.phase.max_budget_usd,
            allowed_tools: allowed_tools.iter().map(|s| s.to_string()).collect(),
        };
        let outcome = self
            .invoker
            .invoke(&agent, user_prompt, work_dir)
            .await
            .map_err(|e| PhaseError::InvokerError(e.into()))?;
        let invocation_result = InvocationResult::new(system_prompt, user_prompt);
        Ok((outcome, invocation_result))
    }

    async fn commit(&self, message: &str) -> Result<(), PhaseError> {
        if let Some(git) = &self.git {
            let git = git.lock().await;
            git.add_all().await.map_err(PhaseError::InvokerError)?;
            git.commit(message).await.map_err(PhaseError::InvokerError)?;
        }
        Ok(())
    }

    async fn base_sha(&self) -> Option<String> {
        if let Some(git) = &self.git {
            let git = git.lock().await;
            git.head_sha().await.ok().flatten()
        } else {
            None
        }
    }

    async fn run_filter_chain(
        &self,
        work_dir: &Path,
        base_sha: Option<&str>,
        start_name: Option<&str>,
    ) -> Result<Vec<filter::CheckResult>, PhaseError> {
        let git_ref: Option<&dyn GitCollaborator> = None;
        // The claims check needs a live reference to the collaborator, not a
        // held guard, so it's resolved inline where the guard can outlive
        // the call — see `claims_guard` below.
        let _ = git_ref;
        let guard = match &self.git {
            Some(git) => Some(git.lock().await),
            None => None,
        };
        let collaborator: Option<&dyn GitCollaborator> =
            guard.as_deref().map(|g| g as &dyn GitCollaborator);
        let ctx = ClaimsContext {
            fabric: &self.fabric,
            phase_id: &self.phase.id,
            scope: &self.phase.scope,
            git: collaborator,
            base_sha,
        };
        filter::run_from(&self.filter_commands, &ctx, work_dir, start_name).await
    }

    /// Re-runs exactly one named check, used by the inner fix loop so a
    /// retry attempt doesn't pay for the whole chain.
    async fn run_single_check(
        &self,
        work_dir: &Path,
        base_sha: Option<&str>,
        name: &str,
    ) -> Result<filter::CheckResult, PhaseError> {
        let guard = match &self.git {
            Some(git) => Some(git.lock().await),
            None => None,
        };
        let collaborator: Option<&dyn GitCollaborator> =
            guard.as_deref().map(|g| g as &dyn GitCollaborator);
        let ctx = ClaimsContext {
            fabric: &self.fabric,
            phase_id: &self.phase.id,
            scope: &self.phase.scope,
            git: collaborator,
            base_sha,
        };
        filter::run_check(&self.filter_commands, &ctx, work_dir, name).await
    }

    /// Renders the focused fix prompt text for a failing check: only its
    /// parsed errors (file/line/col/message) and the affected file paths,
    /// never the raw combined stdout/stderr.
    fn focused_fix_text(failing: &filter::CheckResult) -> String {
        if failing.errors.is_empty() {
            return failing.output.clone();
        }
        let files: Vec<&str> = {
            let mut seen = Vec::new();
            for e in &failing.errors {
                if !seen.contains(&e.file.as_str()) {
                    seen.push(e.file.as_str());
                }
            }
            seen
        };
        let mut text = format!("Affected files: {}\n", files.join(", "));
        for e in &failing.errors {
            text.push_str(&format!("{}:{}:{}: {}\n", e.file, e.line, e.col, e.message));
        }
        text
    }

    /// Runs the inner fix loop against the first failing check, re-running
    /// only that check via [`filter::run_check`] after each attempt. Once it
    /// passes, re-verifies the whole chain starting at its predecessor for
    /// regression safety. Returns the final filter results once every check
    /// passes, or a `FilterRecoverable` error once `max_filter_fixes` is
    /// exhausted.
    async fn fix_filter_failure(
        &self,
        state: &mut CycleState,
        work_dir: &Path,
        base_sha: Option<&str>,
        results: Vec<filter::CheckResult>,
    ) -> Result<Vec<filter::CheckResult>, PhaseError> {
        let Some(mut failing) = results.iter().find(|r| !r.passed).cloned() else {
            return Ok(results);
        };
        if failing.name == "claims" {
            return Err(PhaseError::ClaimViolation {
                path: failing
                    .errors
                    .first()
                    .map(|e| e.file.clone())
                    .unwrap_or_default(),
                held_by: None,
            });
        }

        loop {
            if state.filter_fix_attempts >= self.config.max_filter_fixes {
                return Err(PhaseError::FilterRecoverable {
                    check: failing.name,
                    attempts: state.filter_fix_attempts,
                });
            }

            let check_name = failing.name.clone();
            state.filter_output = Some(Self::focused_fix_text(&failing));
            state.filter_check_name = Some(check_name.clone());
            state.filter_fix_attempts += 1;

            self.hooks
                .emit(
                    &Event::new(EventKind::FilterFixAttempt, &self.phase.id, state.cycle).with_filter_fix(
                        FilterFixInfo {
                            check: check_name.clone(),
                            attempt: state.filter_fix_attempts,
                            passed: false,
                        },
                    ),
                )
                .await;

            let hail_block = self.hail_block().await;
            let fabric_snapshot = self.fabric_snapshot().await;
            let user_prompt =
                prompt::build_user_prompt(state, hail_block.as_deref(), Some(&fabric_snapshot));
            let (outcome, _invocation) = self
                .invoke(
                    "coder",
                    &self.coder_system_prompt,
                    &user_prompt,
                    FIX_LOOP_TOOLS,
                    work_dir,
                )
                .await?;
            state.coder_output = Some(outcome.result_text.clone());
            state.filter_fix_cost_usd += outcome.cost_usd;
            state.total_cost_usd += outcome.cost_usd;
            self.check_budget(state)?;

            self.commit(&format!(
                "fix {check_name} (attempt {} for phase {})",
                state.filter_fix_attempts, self.phase.id
            ))
            .await?;

            let rerun = self.run_single_check(work_dir, base_sha, &check_name).await?;
            let passed = rerun.passed;
            self.hooks
                .emit(
                    &Event::new(EventKind::FilterFixResult, &self.phase.id, state.cycle).with_filter_fix(
                        FilterFixInfo {
                            check: check_name,
                            attempt: state.filter_fix_attempts,
                            passed,
                        },
                    ),
                )
                .await;

            if passed {
                state.filter_output = None;
                state.filter_check_name = None;
                return self.run_filter_chain(work_dir, base_sha, Some(&rerun.name)).await;
            }
            failing = rerun;
        }
    }

    /// Runs the full loop to completion: approval, the cycle ceiling, or a
    /// fatal error. `refactor_rx` delivers mid-run task description updates
    /// between cycles. Emits a terminal `TaskSuccess`/`TaskFailed` hook event
    /// around whatever `run_loop` decides.
    pub async fn run(
        &self,
        state: &mut CycleState,
        work_dir: &Path,
        refactor_rx: Option<mpsc::Receiver<String>>,
    ) -> Result<CycleOutcome, PhaseError> {
        let result = self.run_loop(state, work_dir, refactor_rx).await;
        match &result {
            Ok(outcome) => {
                self.hooks
                    .emit(
                        &Event::new(EventKind::TaskSuccess, &self.phase.id, outcome.cycles_used)
                            .with_result(format!("approved after {} cycle(s)", outcome.cycles_used)),
                    )
                    .await;
            }
            Err(err) => {
                self.hooks
                    .emit(
                        &Event::new(EventKind::TaskFailed, &self.phase.id, state.cycle)
                            .with_err(err.to_string()),
                    )
                    .await;
            }
        }
        result
    }

    async fn run_loop(
        &self,
        state: &mut CycleState,
        work_dir: &Path,
        mut refactor_rx: Option<mpsc::Receiver<String>>,
    ) -> Result<CycleOutcome, PhaseError> {
        let mut cache_hit_count = 0;
        let mut cache_miss_count = 0;
        let mut total_cached_bytes: u64 = 0;
        let mut report = None;

        loop {
            self.hooks
                .emit(&Event::new(EventKind::CycleStart, &self.phase.id, state.cycle))
                .await;

            if let Some(rx) = refactor_rx.as_mut()
                && let Ok(new_description) = rx.try_recv()
            {
                state.apply_refactor(new_description);
                self.hooks
                    .emit(
                        &Event::new(EventKind::TaskRefactored, &self.phase.id, state.cycle).with_message(
                            format!(
                                "task description updated mid-run: {:?} -> {:?}",
                                state.original_description, state.task_description
                            ),
                        ),
                    )
                    .await;
            }

            self.check_budget(state)?;

            let hail_block = self.hail_block().await;
            let fabric_snapshot = self.fabric_snapshot().await;
            let user_prompt =
                prompt::build_user_prompt(state, hail_block.as_deref(), Some(&fabric_snapshot));
            let (coder_outcome, invocation_result) = self
                .invoke("coder", &self.coder_system_prompt, &user_prompt, &[], work_dir)
                .await?;
            self.hooks
                .emit(
                    &Event::new(EventKind::AgentDone, &self.phase.id, state.cycle)
                        .with_agent_role("coder")
                        .with_result(coder_outcome.result_text.clone()),
                )
                .await;

            if self.config.cache_optimization {
                if invocation_result.is_cache_hit(state.prev_system_prompt_hash.as_deref()) {
                    cache_hit_count += 1;
                    total_cached_bytes += invocation_result.system_prompt_len as u64;
                } else {
                    cache_miss_count += 1;
                }
                self.hooks
                    .emit(
                        &Event::new(EventKind::CacheMetrics, &self.phase.id, state.cycle).with_message(
                            format!(
                                "cache_hit_count={cache_hit_count} cache_miss_count={cache_miss_count}"
                            ),
                        ),
                    )
                    .await;
            }
            state.prev_system_prompt_hash = Some(invocation_result.system_prompt_hash.clone());
            state.coder_output = Some(coder_outcome.result_text.clone());
            state.total_cost_usd += coder_outcome.cost_usd;
            self.check_budget(state)?;

            self.commit(&format!("phase {} cycle {} coder changes", self.phase.id, state.cycle))
                .await?;

            let base_sha = self.base_sha().await;
            let filter_results = self.run_filter_chain(work_dir, base_sha.as_deref(), None).await?;
            let filter_results = self
                .fix_filter_failure(state, work_dir, base_sha.as_deref(), filter_results)
                .await?;
            state.filter_output = None;
            state.filter_check_name = None;
            let _ = filter_results;

            if let Some(callback) = &self.on_reviewer_stage {
                callback(&self.phase.id);
            }

            let review_prompt = prompt::build_user_prompt(state, None, Some(&fabric_snapshot));
            let (review_outcome, _review_invocation) = self
                .invoke(
                    "reviewer",
                    &self.reviewer_system_prompt,
                    &review_prompt,
                    &[],
                    work_dir,
                )
                .await?;
            self.hooks
                .emit(
                    &Event::new(EventKind::AgentDone, &self.phase.id, state.cycle)
                        .with_agent_role("reviewer")
                        .with_result(review_outcome.result_text.clone()),
                )
                .await;
            state.review_output = Some(review_outcome.result_text.clone());
            state.total_cost_usd += review_outcome.cost_usd;
            self.check_budget(state)?;

            let parsed = review::parse_reviewer_output(&review_outcome.result_text);
            state.verifications = parsed.verifications.clone();
            apply_verifications(&mut state.all_findings, &parsed.verifications);

            let new_findings: Vec<ReviewFinding> = parsed
                .issues
                .iter()
                .map(|(severity, description)| {
                    ReviewFinding::new(*severity, description.clone(), state.cycle)
                })
                .filter(|finding| !state.all_findings.iter().any(|f| f.id == finding.id))
                .collect();
            state.findings = new_findings.clone();
            state.all_findings.extend(new_findings);
            report = parsed.report.clone();

            self.hooks
                .emit(
                    &Event::new(EventKind::ReviewComplete, &self.phase.id, state.cycle)
                        .with_findings(state.findings.clone()),
                )
                .await;

            let still_open = review::open_findings(&state.all_findings);
            let has_blocking = still_open.iter().any(|f| f.severity != FindingSeverity::Note);

            if parsed.approved && !has_blocking {
                return Ok(CycleOutcome {
                    approved: true,
                    cycles_used: state.cycle,
                    total_cost_usd: state.total_cost_usd,
                    report,
                    cache_hit_count,
                    cache_miss_count,
                    total_cached_bytes,
                });
            }

            if state.cycle >= self.phase.max_review_cycles {
                return Err(PhaseError::MaxCyclesReached {
                    max_cycles: self.phase.max_review_cycles,
                });
            }

            state.cycle += 1;
        }
    }
}
