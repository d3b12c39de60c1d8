//! Worker group and speculative dispatch: the bounded
//! parallelism tick loop that turns DAG eligibility into running
//! coder-reviewer loops, confirms or discards speculative work as
//! dependencies resolve, and rolls back discarded work through git.
//!
//! A slot in `max_workers` is occupied by both confirmed and speculative
//! phases alike — the tracker's `in_flight` set is the single source of
//! truth the dispatch loop budgets against.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::architect::RefactorChannels;
use crate::config::NebulaConfig;
use crate::cycle::{CycleOutcome, CycleRunner, CycleState};
use crate::dag::builder::{DagBuilder, PhaseGraph, PhaseIndex};
use crate::dag::scheduler::{self, TrackerSnapshot};
use crate::errors::{DagError, PhaseError};
use crate::fabric::{Fabric, PhaseState};
use crate::filter::FilterCommands;
use crate::gater::{GateBoundary, GateOutcome, GateSink};
use crate::hail::HailQueue;
use crate::hooks::HookRegistry;
use crate::invoker::LlmInvoker;
use crate::phase::PhaseSpec;
use crate::tracker::git::GitCollaborator;
use crate::tracker::{PhaseTracker, SpeculativeContext};

/// How often the tick loop re-polls eligibility when nothing arrives on the
/// completion channel. A dependency entering its reviewer stage unlocks
/// speculative dispatch of its dependents without itself producing a
/// completion, so the loop can't wait on the channel alone.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Everything about where and how a phase actually runs that isn't part of
/// its spec: the working tree and the gate surface.
pub struct WorkerOptions {
    pub project_dir: PathBuf,
    pub project_context: String,
    pub gate_sink: Option<GateSink>,
    pub hooks: HookRegistry,
}

/// Terminal outcome recorded for one phase's full run.
pub struct PhaseRunOutcome {
    pub phase_id: String,
    pub result: Result<CycleOutcome, PhaseError>,
    pub was_speculative: bool,
}

#[derive(Default)]
pub struct RunReport {
    pub outcomes: Vec<PhaseRunOutcome>,
    pub speculative_confirmed: u64,
    pub speculative_discarded: u64,
}

struct Completion {
    index: PhaseIndex,
    phase_id: String,
    result: Result<CycleOutcome, PhaseError>,
}

/// Drives a whole nebula's phase graph to completion.
pub struct WorkerGroup {
    graph: StdMutex<PhaseGraph>,
    config: NebulaConfig,
    tracker: std::sync::Arc<PhaseTracker>,
    fabric: std::sync::Arc<Fabric>,
    invoker: std::sync::Arc<dyn LlmInvoker>,
    git: Option<std::sync::Arc<AsyncMutex<dyn GitCollaborator>>>,
    filter_commands: FilterCommands,
    hail: Option<std::sync::Arc<HailQueue>>,
    opts: WorkerOptions,
    cancels: StdMutex<HashMap<String, CancellationToken>>,
    pending_speculative_results: StdMutex<HashMap<String, Result<CycleOutcome, PhaseError>>>,
    refactor_channels: StdMutex<RefactorChannels>,
}

impl WorkerGroup {
    pub fn new(
        graph: PhaseGraph,
        config: NebulaConfig,
        fabric: std::sync::Arc<Fabric>,
        invoker: std::sync::Arc<dyn LlmInvoker>,
        git: Option<std::sync::Arc<AsyncMutex<dyn GitCollaborator>>>,
        filter_commands: FilterCommands,
        hail: Option<std::sync::Arc<HailQueue>>,
        opts: WorkerOptions,
    ) -> Self {
        Self {
            graph: StdMutex::new(graph),
            config,
            tracker: std::sync::Arc::new(PhaseTracker::new()),
            fabric,
            invoker,
            git,
            filter_commands,
            hail,
            opts,
            cancels: StdMutex::new(HashMap::new()),
            pending_speculative_results: StdMutex::new(HashMap::new()),
            refactor_channels: StdMutex::new(RefactorChannels::new()),
        }
    }

    /// Builds the phase graph from a flat phase list before constructing the
    /// worker group, applying dependency inference.
    pub fn from_phases(
        phases: Vec<PhaseSpec>,
        config: NebulaConfig,
        fabric: std::sync::Arc<Fabric>,
        invoker: std::sync::Arc<dyn LlmInvoker>,
        git: Option<std::sync::Arc<AsyncMutex<dyn GitCollaborator>>>,
        filter_commands: FilterCommands,
        hail: Option<std::sync::Arc<HailQueue>>,
        opts: WorkerOptions,
    ) -> Result<Self, DagError> {
        let graph = DagBuilder::new(phases).build()?;
        Ok(Self::new(graph, config, fabric, invoker, git, filter_commands, hail, opts))
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    /// Delivers a mid-run task-description update to a currently dispatched
    /// phase. A no-op (returns `false`) if the phase isn't running — its
    /// refactor channel is only registered while it's in flight.
    pub async fn request_refactor(&self, phase_id: &str, new_description: String) -> bool {
        let sender = self.refactor_channels.lock().unwrap().sender(phase_id);
        let Some(sender) = sender else {
            return false;
        };
        crate::architect::send_refactor_on(&sender, new_description).await
    }

    /// Applies an architect-issued hot-add: re-validates and re-infers the
    /// DAG with `new_phase` appended, rejecting on cycle introduction or a
    /// scope conflict with a currently running phase. Existing phases keep
    /// their indices (the rebuilt graph is built from the same phase order
    /// with the new one appended last), so in-flight `PhaseIndex` values
    /// stay valid across the swap. On success the new phase is eligible for
    /// dispatch on `run`'s next tick, which reads the graph fresh each time.
    pub fn hot_add(&self, new_phase: PhaseSpec) -> Result<(), crate::architect::HotAddError> {
        let running = self.tracker.in_flight();
        let running_ids: Vec<&str> = running.iter().map(|s| s.as_str()).collect();
        let mut graph = self.graph.lock().unwrap();
        let existing = graph.phases().to_vec();
        let rebuilt = crate::architect::hot_add(&existing, new_phase, &running_ids)?;
        *graph = rebuilt;
        Ok(())
    }

    fn snapshot_sets(
        &self,
    ) -> (
        HashSet<PhaseIndex>,
        HashSet<PhaseIndex>,
        HashSet<PhaseIndex>,
        HashSet<PhaseIndex>,
        HashSet<PhaseIndex>,
    ) {
        let graph = self.graph.lock().unwrap();
        let to_idx = |ids: HashSet<String>| -> HashSet<PhaseIndex> {
            ids.iter().filter_map(|id| graph.get_index(id)).collect()
        };
        (
            to_idx(self.tracker.done()),
            to_idx(self.tracker.failed()),
            to_idx(self.tracker.in_flight()),
            to_idx(self.tracker.speculative()),
            to_idx(self.tracker.in_reviewer_stage()),
        )
    }

    fn eligible_now(&self) -> Vec<PhaseIndex> {
        let (done, failed, in_flight, speculative, in_reviewer_stage) = self.snapshot_sets();
        let snapshot = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        let graph = self.graph.lock().unwrap();
        scheduler::resolve_eligible(&graph, &snapshot)
    }

    fn speculative_now(&self) -> Vec<(PhaseIndex, PhaseIndex)> {
        let (done, failed, in_flight, speculative, in_reviewer_stage) = self.snapshot_sets();
        let snapshot = TrackerSnapshot {
            done: &done,
            failed: &failed,
            in_flight: &in_flight,
            speculative: &speculative,
            in_reviewer_stage: &in_reviewer_stage,
        };
        let graph = self.graph.lock().unwrap();
        scheduler::resolve_speculative(&graph, &snapshot)
            .into_iter()
            .filter(|&(index, _)| {
                graph
                    .get_phase(index)
                    .is_some_and(|p| p.speculative_enabled(self.config.speculative))
            })
            .collect()
    }

    fn running_specs(&self) -> Vec<PhaseSpec> {
        let graph = self.graph.lock().unwrap();
        self.tracker
            .in_flight()
            .iter()
            .filter_map(|id| graph.get_phase_by_id(id))
            .cloned()
            .collect()
    }

    async fn capture_base_sha(&self) -> Option<String> {
        let git = self.git.as_ref()?;
        let git = git.lock().await;
        git.head_sha().await.ok().flatten()
    }

    /// Drives every phase in the graph to completion: confirmed dispatch
    /// when all dependencies are done, speculative dispatch when exactly one
    /// dependency remains and that dependency has reached its reviewer
    /// stage, and a git-backed rollback when a speculative bet loses.
    pub async fn run(&self) -> RunReport {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
        let mut report = RunReport::default();
        let mut first_tick = true;

        loop {
            if let Some(hail) = &self.hail {
                hail.sweep_timeouts().await;
            }

            let completion = if first_tick {
                first_tick = false;
                completion_rx.try_recv().ok()
            } else {
                tokio::time::timeout(TICK_INTERVAL, completion_rx.recv())
                    .await
                    .ok()
                    .flatten()
            };

            if let Some(completion) = completion {
                self.handle_completion(completion, &mut report).await;
            }

            loop {
                if self.tracker.in_flight().len() >= self.config.max_workers {
                    break;
                }
                let eligible = self.eligible_now();
                let running = self.running_specs();
                let running_refs: Vec<&PhaseSpec> = running.iter().collect();
                let graph = self.graph.lock().unwrap();
                let Some(index) = eligible.into_iter().find(|&i| {
                    let phase = graph.get_phase(i).expect("valid index");
                    !scheduler::scope_conflicts_with_running(phase, &running_refs)
                }) else {
                    break;
                };
                let phase = graph.get_phase(index).expect("valid index").clone();
                drop(graph);
                self.dispatch_confirmed(index, phase, completion_tx.clone()).await;
            }

            if self.config.speculative_possible() {
                loop {
                    if self.tracker.in_flight().len() >= self.config.max_workers {
                        break;
                    }
                    let candidates = self.speculative_now();
                    let running = self.running_specs();
                    let running_refs: Vec<&PhaseSpec> = running.iter().collect();
                    let mut dispatched = false;
                    for (index, dep_index) in candidates {
                        let (phase, dep_id) = {
                            let graph = self.graph.lock().unwrap();
                            let phase = graph.get_phase(index).expect("valid index");
                            if scheduler::scope_conflicts_with_running(phase, &running_refs) {
                                continue;
                            }
                            let dep_id = graph.get_phase(dep_index).expect("valid index").id.clone();
                            (phase.clone(), dep_id)
                        };
                        let Some(base_sha) = self.capture_base_sha().await else {
                            continue;
                        };
                        self.dispatch_speculative(index, phase, dep_id, base_sha, completion_tx.clone());
                        dispatched = true;
                        break;
                    }
                    if !dispatched {
                        break;
                    }
                }
            }

            let idle = self.tracker.in_flight().is_empty()
                && self.eligible_now().is_empty()
                && self.speculative_now().is_empty();
            if idle {
                break;
            }
        }

        report
    }

    async fn dispatch_confirmed(
        &self,
        index: PhaseIndex,
        phase: PhaseSpec,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) {
        self.tracker.mark_in_flight(&phase.id);
        let _ = self.fabric.set_phase_state(&phase.id, PhaseState::Running).await;
        let refactor_rx = self.refactor_channels.lock().unwrap().register(&phase.id);
        self.spawn_phase(index, phase, None, Some(refactor_rx), completion_tx);
    }

    fn dispatch_speculative(
        &self,
        index: PhaseIndex,
        phase: PhaseSpec,
        dep_id: String,
        base_sha: String,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) {
        let ctx = SpeculativeContext {
            depends_on_phase_id: dep_id,
            base_commit_sha: base_sha,
            started_at: Utc::now(),
        };
        self.tracker.mark_speculative(&phase.id, ctx);
        let fabric = self.fabric.clone();
        let phase_id = phase.id.clone();
        tokio::spawn(async move {
            let _ = fabric.set_phase_state(&phase_id, PhaseState::Speculative).await;
        });
        let cancel = CancellationToken::new();
        self.cancels.lock().unwrap().insert(phase.id.clone(), cancel.clone());
        let refactor_rx = self.refactor_channels.lock().unwrap().register(&phase.id);
        self.spawn_phase(index, phase, Some(cancel), Some(refactor_rx), completion_tx);
    }

    fn spawn_phase(
        &self,
        index: PhaseIndex,
        phase: PhaseSpec,
        cancel: Option<CancellationToken>,
        refactor_rx: Option<mpsc::Receiver<String>>,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) {
        let phase_id = phase.id.clone();
        let config = self.config.clone();
        let project_context = self.opts.project_context.clone();
        let invoker = self.invoker.clone();
        let git = self.git.clone();
        let fabric = self.fabric.clone();
        let filter_commands = self.filter_commands.clone();
        let hail = self.hail.clone();
        let work_dir = self.opts.project_dir.clone();
        let hooks = self.opts.hooks.clone();

        let tracker_for_callback = self.tracker.clone();
        let reviewer_stage_id = phase_id.clone();

        tokio::spawn(async move {
            let mut runner = CycleRunner::new(
                phase.clone(),
                config,
                &project_context,
                invoker,
                git,
                fabric,
                filter_commands,
            );
            if let Some(hail) = hail {
                runner = runner.with_hail(hail);
            }
            runner = runner.with_hooks(hooks);
            runner = runner.with_reviewer_stage_callback(std::sync::Arc::new(move |_id: &str| {
                tracker_for_callback.mark_entering_reviewer_stage(&reviewer_stage_id);
            }));

            let mut state = CycleState::new(&phase);
            let result = match &cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(PhaseError::InvokerError(anyhow::anyhow!(
                            "phase {phase_id} cancelled (dependency review failed)"
                        ))),
                        res = runner.run(&mut state, &work_dir, refactor_rx) => res,
                    }
                }
                None => runner.run(&mut state, &work_dir, refactor_rx).await,
            };

            let _ = completion_tx.send(Completion {
                index,
                phase_id,
                result,
            });
        });
    }

    async fn handle_completion(&self, completion: Completion, report: &mut RunReport) {
        let Completion { index, phase_id, result } = completion;

        if self.tracker.is_speculative(&phase_id) {
            self.pending_speculative_results
                .lock()
                .unwrap()
                .insert(phase_id, result);
            return;
        }

        self.finalize_phase(index, &phase_id, result, false, report).await;
        self.resolve_speculative_outcomes(index, &phase_id, report).await;
    }

    async fn finalize_phase(
        &self,
        index: PhaseIndex,
        phase_id: &str,
        result: Result<CycleOutcome, PhaseError>,
        was_speculative: bool,
        report: &mut RunReport,
    ) {
        let succeeded = result.is_ok();
        let phase = self.graph.lock().unwrap().get_phase(index).cloned();

        let gate_outcome = if let Some(phase) = &phase {
            phase
                .gate
                .apply(
                    phase_id,
                    GateBoundary::PhaseBoundary,
                    format!(
                        "phase {phase_id} finished ({})",
                        if succeeded { "approved" } else { "failed" }
                    ),
                    self.opts.gate_sink.as_ref(),
                )
                .await
        } else {
            GateOutcome::Proceed
        };

        if succeeded && gate_outcome != GateOutcome::Reject {
            let _ = self.fabric.set_phase_state(phase_id, PhaseState::Done).await;
            self.tracker.mark_done(phase_id);
        } else {
            let _ = self.fabric.set_phase_state(phase_id, PhaseState::Failed).await;
            self.tracker.mark_failed(phase_id);
        }

        self.cancels.lock().unwrap().remove(phase_id);
        self.refactor_channels.lock().unwrap().unregister(phase_id);
        report.outcomes.push(PhaseRunOutcome {
            phase_id: phase_id.to_string(),
            result,
            was_speculative,
        });
    }

    /// Once a phase finalizes, resolve every speculative child whose bet was
    /// riding on exactly this dependency: confirm if it succeeded, discard
    /// with a git rollback if it didn't.
    async fn resolve_speculative_outcomes(
        &self,
        dep_index: PhaseIndex,
        dep_id: &str,
        report: &mut RunReport,
    ) {
        let dep_done = self.tracker.done().contains(dep_id);
        let dep_failed = self.tracker.failed().contains(dep_id);
        if !dep_done && !dep_failed {
            return;
        }

        let dependents: Vec<PhaseIndex> = self.graph.lock().unwrap().dependents(dep_index).to_vec();
        for child_index in dependents {
            let Some(child_id) = self.graph.lock().unwrap().get_phase(child_index).map(|p| p.id.clone())
            else {
                continue;
            };
            if !self.tracker.is_speculative(&child_id) {
                continue;
            }
            let Some(ctx) = self.tracker.speculative_context(&child_id) else {
                continue;
            };
            if ctx.depends_on_phase_id != dep_id {
                continue;
            }

            if dep_done {
                self.confirm_speculative_child(child_index, &child_id, report).await;
            } else {
                self.discard_speculative_phase(&child_id, &ctx, report).await;
            }
        }
    }

    async fn confirm_speculative_child(
        &self,
        index: PhaseIndex,
        child_id: &str,
        report: &mut RunReport,
    ) {
        report.speculative_confirmed += 1;
        let pending = self.pending_speculative_results.lock().unwrap().remove(child_id);
        self.tracker.confirm_speculative(child_id);
        match pending {
            Some(result) => self.finalize_phase(index, child_id, result, true, report).await,
            None => {
                let _ = self.fabric.set_phase_state(child_id, PhaseState::Running).await;
            }
        }
    }

    /// Cancels the speculative phase's task, reverts any working-tree
    /// changes it made past its captured base SHA, releases its claims, and
    /// returns it to `QUEUED` so the next tick can re-dispatch it for real.
    async fn discard_speculative_phase(
        &self,
        child_id: &str,
        ctx: &SpeculativeContext,
        report: &mut RunReport,
    ) {
        if let Some(cancel) = self.cancels.lock().unwrap().remove(child_id) {
            cancel.cancel();
        }
        // A completion racing in concurrently with the discard belongs to
        // work that's about to be thrown away; drop it rather than finalize.
        self.pending_speculative_results.lock().unwrap().remove(child_id);
        self.refactor_channels.lock().unwrap().unregister(child_id);

        if let Some(git) = &self.git {
            let git = git.lock().await;
            if let Ok(changed) = git.diff(&ctx.base_commit_sha, "HEAD").await
                && !changed.is_empty()
            {
                let _ = git.checkout(&ctx.base_commit_sha, &[]).await;
                let _ = git.add_all().await;
                let _ = git
                    .commit(&format!(
                        "revert speculative work for phase {child_id} (dependency review failed)"
                    ))
                    .await;
            }
        }

        let _ = self.fabric.release_claims(child_id).await;
        let _ = self.fabric.set_phase_state(child_id, PhaseState::Queued).await;
        self.tracker.discard_speculative(child_id);
        report.speculative_discarded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::GateMode;
    use crate::invoker::{FnInvoker, InvocationOutcome};
    use async_trait::async_trait;
    use std::path::PathBuf as StdPathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn phase(id: &str, deps: &[&str]) -> PhaseSpec {
        PhaseSpec {
            id: id.to_string(),
            title: format!("Phase {id}"),
            body: String::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            blocks: HashSet::new(),
            scope: Vec::new(),
            allow_scope_overlap: false,
            priority: 0,
            max_review_cycles: 2,
            max_budget_usd: 0.0,
            model: "default".into(),
            gate: GateMode::Trust,
            speculative: None,
        }
    }

    fn passthrough_commands() -> FilterCommands {
        FilterCommands {
            build: vec!["true".into()],
            vet: vec!["true".into()],
            lint: vec!["true".into()],
            test: vec!["true".into()],
        }
    }

    struct NoopGit {
        commits: AtomicU32,
    }

    #[async_trait]
    impl GitCollaborator for NoopGit {
        async fn add_all(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn commit(&self, _message: &str) -> anyhow::Result<String> {
            let n = self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{n:040x}"))
        }
        async fn diff(&self, _base: &str, _head: &str) -> anyhow::Result<Vec<StdPathBuf>> {
            Ok(vec![])
        }
        async fn head_sha(&self) -> anyhow::Result<Option<String>> {
            Ok(Some("0".repeat(40)))
        }
        async fn checkout(&self, _sha: &str, _paths: &[StdPathBuf]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// A `GitCollaborator` double that always reports a non-empty diff, so
    /// discard tests exercise the rollback branch deterministically.
    struct DirtyGit {
        checkouts: AtomicU32,
        commits: AtomicU32,
    }

    #[async_trait]
    impl GitCollaborator for DirtyGit {
        async fn add_all(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn commit(&self, _message: &str) -> anyhow::Result<String> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok("c".repeat(40))
        }
        async fn diff(&self, _base: &str, _head: &str) -> anyhow::Result<Vec<StdPathBuf>> {
            Ok(vec![StdPathBuf::from("src/changed.rs")])
        }
        async fn head_sha(&self) -> anyhow::Result<Option<String>> {
            Ok(Some("h".repeat(40)))
        }
        async fn checkout(&self, _sha: &str, _paths: &[StdPathBuf]) -> anyhow::Result<()> {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn approving_invoker() -> Arc<dyn LlmInvoker> {
        Arc::new(FnInvoker(|agent, _prompt| {
            let text = if agent.role == "reviewer" {
                "APPROVED:\n".to_string()
            } else {
                "did the work".to_string()
            };
            Ok(InvocationOutcome {
                result_text: text,
                cost_usd: 0.0,
                duration_ms: 1,
                session_id: None,
            })
        }))
    }

    fn group(
        phases: Vec<PhaseSpec>,
        config: NebulaConfig,
        invoker: Arc<dyn LlmInvoker>,
        project_dir: PathBuf,
    ) -> WorkerGroup {
        WorkerGroup::from_phases(
            phases,
            config,
            Arc::new(Fabric::open_in_memory().unwrap()),
            invoker,
            Some(Arc::new(AsyncMutex::new(NoopGit {
                commits: AtomicU32::new(0),
            }))),
            passthrough_commands(),
            None,
            WorkerOptions {
                project_dir,
                project_context: "project context".to_string(),
                gate_sink: None,
                hooks: HookRegistry::new(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn runs_independent_phases_to_completion_under_a_single_worker() {
        let dir = tempdir().unwrap();
        let mut config = NebulaConfig::default();
        config.max_workers = 1;
        let worker = group(
            vec![phase("01", &[]), phase("02", &[])],
            config,
            approving_invoker(),
            dir.path().to_path_buf(),
        );

        let report = worker.run().await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.result.is_ok()));
        assert!(worker.tracker().done().contains("01"));
        assert!(worker.tracker().done().contains("02"));
    }

    #[tokio::test]
    async fn hot_add_inserts_a_reachable_phase_that_then_runs() {
        let dir = tempdir().unwrap();
        let worker = group(
            vec![phase("01", &[])],
            NebulaConfig::default(),
            approving_invoker(),
            dir.path().to_path_buf(),
        );

        worker.hot_add(phase("02", &["01"])).unwrap();

        let report = worker.run().await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(worker.tracker().done().contains("01"));
        assert!(worker.tracker().done().contains("02"));
    }

    #[tokio::test]
    async fn hot_add_rejects_a_phase_whose_scope_conflicts_with_a_running_one() {
        let dir = tempdir().unwrap();
        let mut p01 = phase("01", &[]);
        p01.scope = vec!["src/a.rs".to_string()];
        let worker = group(
            vec![p01],
            NebulaConfig::default(),
            approving_invoker(),
            dir.path().to_path_buf(),
        );
        worker.tracker().mark_in_flight("01");

        let mut p02 = phase("02", &[]);
        p02.scope = vec!["src/a.rs".to_string()];
        let result = worker.hot_add(p02);

        assert!(matches!(
            result,
            Err(crate::architect::HotAddError::ScopeConflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn request_refactor_reaches_only_a_dispatched_phases_channel() {
        let dir = tempdir().unwrap();
        // The coder call sleeps briefly so the dispatched phase's cycle is
        // still in flight when the test tries to deliver a refactor.
        let invoker: Arc<dyn LlmInvoker> = Arc::new(FnInvoker(|agent, _prompt| {
            if agent.role == "reviewer" {
                Ok(InvocationOutcome {
                    result_text: "APPROVED:\n".to_string(),
                    cost_usd: 0.0,
                    duration_ms: 1,
                    session_id: None,
                })
            } else {
                std::thread::sleep(Duration::from_millis(150));
                Ok(InvocationOutcome {
                    result_text: "did the work".to_string(),
                    cost_usd: 0.0,
                    duration_ms: 150,
                    session_id: None,
                })
            }
        }));
        let worker = group(
            vec![phase("01", &[])],
            NebulaConfig::default(),
            invoker,
            dir.path().to_path_buf(),
        );

        assert!(!worker.request_refactor("01", "too early".to_string()).await);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (phase_spec, index) = {
            let graph = worker.graph.lock().unwrap();
            (
                graph.get_phase_by_id("01").unwrap().clone(),
                graph.get_index("01").unwrap(),
            )
        };
        worker.dispatch_confirmed(index, phase_spec, tx).await;

        assert!(worker.request_refactor("01", "mid-run update".to_string()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dependent_phase_speculatively_dispatches_while_dependency_is_in_review() {
        let dir = tempdir().unwrap();
        let mut config = NebulaConfig::default();
        config.max_workers = 2;
        config.speculative = true;
        // Phase 01's reviewer call blocks briefly so the tick loop has a
        // window, after 01 enters its reviewer stage, to notice 02's sole
        // dependency is in-flight-and-reviewing and dispatch it speculatively
        // before 01 actually finishes.
        let invoker: Arc<dyn LlmInvoker> = Arc::new(FnInvoker(|agent, _prompt| {
            if agent.role == "reviewer" {
                std::thread::sleep(Duration::from_millis(150));
                Ok(InvocationOutcome {
                    result_text: "APPROVED:\n".to_string(),
                    cost_usd: 0.0,
                    duration_ms: 150,
                    session_id: None,
                })
            } else {
                Ok(InvocationOutcome {
                    result_text: "did the work".to_string(),
                    cost_usd: 0.0,
                    duration_ms: 1,
                    session_id: None,
                })
            }
        }));
        let worker = group(
            vec![phase("01", &[]), phase("02", &["01"])],
            config,
            invoker,
            dir.path().to_path_buf(),
        );

        let report = worker.run().await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(worker.tracker().done().contains("01"));
        assert!(worker.tracker().done().contains("02"));
        assert_eq!(report.speculative_confirmed, 1);
    }

    #[tokio::test]
    async fn dependent_phase_only_finalizes_after_its_dependency() {
        let dir = tempdir().unwrap();
        let mut config = NebulaConfig::default();
        config.max_workers = 2;
        let worker = group(
            vec![phase("01", &[]), phase("02", &["01"])],
            config,
            approving_invoker(),
            dir.path().to_path_buf(),
        );

        let report = worker.run().await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(worker.tracker().done().contains("01"));
        assert!(worker.tracker().done().contains("02"));
    }

    #[tokio::test]
    async fn failing_phase_never_unlocks_its_dependent() {
        let dir = tempdir().unwrap();
        let rejecting_invoker: Arc<dyn LlmInvoker> = Arc::new(FnInvoker(|agent, _prompt| {
            let text = if agent.role == "reviewer" {
                "ISSUE: still broken\n".to_string()
            } else {
                "trying".to_string()
            };
            Ok(InvocationOutcome {
                result_text: text,
                cost_usd: 0.0,
                duration_ms: 1,
                session_id: None,
            })
        }));
        let mut config = NebulaConfig::default();
        config.max_workers = 2;
        let worker = group(
            vec![phase("01", &[]), phase("02", &["01"])],
            config,
            rejecting_invoker,
            dir.path().to_path_buf(),
        );

        let report = worker.run().await;

        assert_eq!(report.outcomes.len(), 1);
        assert!(worker.tracker().failed().contains("01"));
        assert!(!worker.tracker().done().contains("02"));
        assert!(!worker.tracker().failed().contains("02"));
    }

    #[tokio::test]
    async fn discard_releases_claims_and_reverts_dirty_working_tree() {
        let dir = tempdir().unwrap();
        let dirty_git = Arc::new(AsyncMutex::new(DirtyGit {
            checkouts: AtomicU32::new(0),
            commits: AtomicU32::new(0),
        }));
        let worker = WorkerGroup::from_phases(
            vec![phase("01", &[]), phase("02", &["01"])],
            NebulaConfig::default(),
            Arc::new(Fabric::open_in_memory().unwrap()),
            approving_invoker(),
            Some(dirty_git.clone()),
            passthrough_commands(),
            None,
            WorkerOptions {
                project_dir: dir.path().to_path_buf(),
                project_context: "ctx".to_string(),
                gate_sink: None,
                hooks: HookRegistry::new(),
            },
        )
        .unwrap();

        worker
            .fabric
            .claim_file("src/changed.rs", "02")
            .await
            .unwrap();
        worker.tracker().mark_in_flight("01");
        worker.tracker().mark_speculative(
            "02",
            SpeculativeContext {
                depends_on_phase_id: "01".to_string(),
                base_commit_sha: "b".repeat(40),
                started_at: Utc::now(),
            },
        );

        let mut report = RunReport::default();
        let ctx = worker.tracker().speculative_context("02").unwrap();
        worker.discard_speculative_phase("02", &ctx, &mut report).await;

        assert_eq!(report.speculative_discarded, 1);
        assert!(!worker.tracker().speculative().contains("02"));
        assert!(!worker.tracker().in_flight().contains("02"));
        assert!(worker.fabric.all_claims().await.unwrap().is_empty());
        let git = dirty_git.lock().await;
        assert_eq!(git.checkouts.load(Ordering::SeqCst), 1);
        assert_eq!(git.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirm_speculative_child_applies_pending_result_immediately() {
        let dir = tempdir().unwrap();
        let worker = group(
            vec![phase("01", &[]), phase("02", &["01"])],
            NebulaConfig::default(),
            approving_invoker(),
            dir.path().to_path_buf(),
        );

        worker.tracker().mark_in_flight("01");
        worker.tracker().mark_speculative(
            "02",
            SpeculativeContext {
                depends_on_phase_id: "01".to_string(),
                base_commit_sha: "a".repeat(40),
                started_at: Utc::now(),
            },
        );
        worker.pending_speculative_results.lock().unwrap().insert(
            "02".to_string(),
            Ok(CycleOutcome {
                approved: true,
                cycles_used: 1,
                total_cost_usd: 0.0,
                report: None,
                cache_hit_count: 0,
                cache_miss_count: 0,
                total_cached_bytes: 0,
            }),
        );

        let mut report = RunReport::default();
        let index = worker.graph.lock().unwrap().get_index("02").unwrap();
        worker.confirm_speculative_child(index, "02", &mut report).await;

        assert_eq!(report.speculative_confirmed, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert!(worker.tracker().done().contains("02"));
    }
}
