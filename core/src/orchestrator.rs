//! Orchestrator
//!
//! Drives the phase state machine for each intent: parsing, clarifying,
//! compiling, generating, verifying, ranking, judging. Every transition
//! is persisted before the next phase's side effects begin, so a crash
//! leaves the intent resumable at the phase boundary. Judgments close the
//! loop: accept applies atomically, refine recompiles a new spec version,
//! redirect starts a fresh intent, abort terminates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::compiler::{walker, CompileOutcome, IntentCompiler};
use crate::config::ManifestConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::events::{IntentLog, PipelineEvent};
use crate::gateway::AiGateway;
use crate::harness::VerificationHarness;
use crate::ranking::{RankInput, RankingEngine};
use crate::report::{
    aggregate_failures, no_survivors_suggestion, FailureCategory, RunOutcome, RunReport,
};
use crate::store::types::{
    Attempt, AttemptStatus, Decision, Intent, IntentStatus, Judgment, Specification, Verification,
};
use crate::store::SharedStore;
use crate::swarm::GenerationSwarm;
use crate::workspace::WorkspaceManager;

/// Top failure categories reported on a no-survivors outcome
const TOP_FAILURE_CATEGORIES: usize = 3;

/// Per-run context threaded through the pipeline.
///
/// Carries the cancellation handle; cost accounting and concurrency
/// permits live in the gateway it wraps. No process-wide state.
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Drives intents through the pipeline and handles judgments
pub struct Orchestrator {
    store: SharedStore,
    gateway: Arc<dyn AiGateway>,
    compiler: IntentCompiler,
    swarm: GenerationSwarm,
    harness: Arc<VerificationHarness>,
    ranking: RankingEngine,
    workspaces: Arc<WorkspaceManager>,
    log: IntentLog,
    config: ManifestConfig,
    project_root: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire up the pipeline over an opened store and a gateway.
    ///
    /// Does not sweep workspaces; call [`Orchestrator::startup`] before
    /// accepting work.
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn AiGateway>,
        config: ManifestConfig,
        data_dir: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
    ) -> PipelineResult<Self> {
        let data_dir = data_dir.into();
        let project_root = project_root.into();

        let workspaces = Arc::new(WorkspaceManager::new(
            &project_root,
            config.workspace_root(&data_dir),
            &config.workspace,
        )?);
        let call_deadline = Duration::from_secs(config.generation.ai_call_timeout_secs);
        let compiler = IntentCompiler::new(
            Arc::clone(&gateway),
            &project_root,
            walker::default_analysis_excludes(),
            config.workspace.max_file_bytes,
            call_deadline,
        );
        let swarm = GenerationSwarm::new(
            Arc::clone(&gateway),
            config.generation.clone(),
            config.gateway.ai_concurrency,
        );
        let harness = Arc::new(VerificationHarness::new(
            Arc::clone(&workspaces),
            config.verification.clone(),
        ));
        let ranking = RankingEngine::new(
            config.ranking.clone(),
            Some(Arc::clone(&gateway)),
            call_deadline,
        );
        let log = IntentLog::new(&data_dir)?;

        Ok(Self {
            store,
            gateway,
            compiler,
            swarm,
            harness,
            ranking,
            workspaces,
            log,
            config,
            project_root,
            cancel: CancellationToken::new(),
        })
    }

    /// Handle used by hosts to cancel everything in flight
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crash-recovery ritual: sweep orphan workspaces, then resume every
    /// non-terminal intent from its persisted phase boundary.
    pub async fn startup(&self) -> PipelineResult<Vec<RunReport>> {
        self.workspaces.sweep_orphans()?;
        let unfinished = self.store.list_unfinished_intents()?;
        let mut reports = Vec::with_capacity(unfinished.len());
        for intent in unfinished {
            info!(intent_id = %intent.id, status = %intent.status, "Resuming intent");
            reports.push(self.resume_intent(intent).await?);
        }
        Ok(reports)
    }

    /// Entry point: run a raw message through the pipeline.
    pub async fn submit(&self, message: &str, session_id: &str) -> PipelineResult<RunReport> {
        let intent = Intent::new(session_id, message);
        self.store.put_intent(&intent)?;
        self.emit(PipelineEvent::IntentReceived {
            intent_id: intent.id.clone(),
            session_id: intent.session_id.clone(),
            message_preview: preview(message),
            timestamp: Utc::now(),
        });
        self.run_pipeline(intent).await
    }

    /// Supply answers to an intent waiting in `clarifying`; re-enters
    /// parsing with the answers appended to the raw message.
    pub async fn clarify(&self, intent_id: &str, answers: &str) -> PipelineResult<RunReport> {
        let mut intent = self.require_intent(intent_id)?;
        if intent.status != IntentStatus::Clarifying {
            return Err(PipelineError::InvalidTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Parsing.to_string(),
            });
        }
        intent.raw_message.push_str("\n\nClarifications:\n");
        intent.raw_message.push_str(answers);
        intent.parsed = None;
        self.enter_phase(&mut intent, IntentStatus::Parsing)?;
        self.run_pipeline(intent).await
    }

    /// Handle a judgment over a presented intent.
    pub async fn judge(&self, judgment: Judgment) -> PipelineResult<RunReport> {
        let mut intent = self.require_intent(&judgment.intent_id)?;
        match judgment.decision {
            Decision::Accept => self.handle_accept(&mut intent, judgment).await,
            Decision::Refine => self.handle_refine(intent, judgment).await,
            Decision::Redirect => self.handle_redirect(intent, judgment).await,
            Decision::Abort => {
                self.store.put_judgment(&judgment)?;
                self.emit_judgment(&judgment);
                self.finish(&mut intent, IntentStatus::Aborted, Some("aborted by judgment"))?;
                Ok(self.report(&intent, RunOutcome::Aborted, Vec::new(), None))
            }
        }
    }

    // =========================================================================
    // Pipeline phases
    // =========================================================================

    async fn run_pipeline(&self, mut intent: Intent) -> PipelineResult<RunReport> {
        let ctx = RunContext::new(self.cancel.child_token());
        match self.drive(&mut intent, &ctx).await {
            Ok(report) => Ok(report),
            Err(PipelineError::Cancelled) => {
                warn!(intent_id = %intent.id, "Run cancelled");
                self.finish(&mut intent, IntentStatus::Aborted, Some("cancelled"))?;
                Ok(self.report(&intent, RunOutcome::Aborted, Vec::new(), None))
            }
            Err(e) => {
                error!(intent_id = %intent.id, phase = %intent.status, error = %e, "Run failed");
                let suggestion = e.suggestion();
                let outcome = RunOutcome::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                self.finish(&mut intent, IntentStatus::Failed, Some(e.kind()))?;
                Ok(self.report(&intent, outcome, Vec::new(), suggestion))
            }
        }
    }

    async fn drive(&self, intent: &mut Intent, ctx: &RunContext) -> PipelineResult<RunReport> {
        // Parse. Fresh and clarified intents pass through the parsing
        // phase here; a refine loop re-enters compiling directly and the
        // compiler re-parses the refined message itself.
        if intent.status == IntentStatus::Parsing || intent.status == IntentStatus::Clarifying {
            self.enter_phase(intent, IntentStatus::Parsing)?;
            if intent.parsed.is_none() {
                let parsed = self.compiler.parse(&intent.raw_message, &ctx.cancel).await?;
                intent.parsed = Some(parsed);
                self.store.update_intent_status(intent)?;
            }
        }

        // Compile
        self.enter_phase(intent, IntentStatus::Compiling)?;
        let version = self
            .store
            .latest_spec(&intent.id)?
            .map(|s| s.version + 1)
            .unwrap_or(1);
        let outcome = self.compiler.compile(intent, version, &ctx.cancel).await?;
        let spec = match outcome {
            CompileOutcome::Ready(spec) => *spec,
            CompileOutcome::Clarify(questions) => {
                self.enter_phase(intent, IntentStatus::Clarifying)?;
                self.emit(PipelineEvent::ClarificationRequested {
                    intent_id: intent.id.clone(),
                    questions: questions.clone(),
                    timestamp: Utc::now(),
                });
                return Ok(self.report(
                    intent,
                    RunOutcome::ClarificationNeeded { questions },
                    Vec::new(),
                    None,
                ));
            }
        };
        self.store.put_spec(&spec)?;
        self.emit(PipelineEvent::SpecCompiled {
            intent_id: intent.id.clone(),
            spec_id: spec.id.clone(),
            version: spec.version,
            assertion_count: spec.assertions.len(),
            timestamp: Utc::now(),
        });
        self.run_from_generation(intent, spec, ctx).await
    }

    async fn run_from_generation(
        &self,
        intent: &mut Intent,
        spec: Specification,
        ctx: &RunContext,
    ) -> PipelineResult<RunReport> {
        self.enter_phase(intent, IntentStatus::Generating)?;
        let spec = Arc::new(spec);
        let batch = self
            .swarm
            .generate(
                Arc::clone(&spec),
                self.config.generation.default_count,
                &ctx.cancel,
            )
            .await;
        for attempt in &batch.attempts {
            self.store.put_attempt(attempt)?;
            self.emit(PipelineEvent::AttemptGenerated {
                intent_id: intent.id.clone(),
                attempt_id: attempt.id.clone(),
                strategy: attempt.strategy,
                kept: true,
                timestamp: Utc::now(),
            });
        }
        self.emit(PipelineEvent::GenerationFinished {
            intent_id: intent.id.clone(),
            kept: batch.attempts.len(),
            discarded: batch.discarded,
            failed: batch.failures.len(),
            cost_stopped: batch.cost_stopped,
            timestamp: Utc::now(),
        });
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut warnings = Vec::new();
        if batch.cost_stopped {
            warnings.push("cost ceiling reached during generation; batch is partial".to_string());
        }
        if batch.low_diversity {
            warnings.push(
                "all generated attempts were identical after dedup (low diversity)".to_string(),
            );
        }

        if batch.attempts.is_empty() {
            let failures: Vec<FailureCategory> = batch
                .failures
                .iter()
                .take(TOP_FAILURE_CATEGORIES)
                .map(|reason| FailureCategory {
                    reason: reason.clone(),
                    count: 1,
                })
                .collect();
            let suggestion = no_survivors_suggestion(&failures);
            self.finish(intent, IntentStatus::Failed, Some("no_survivors"))?;
            return Ok(self.report(
                intent,
                RunOutcome::NoSurvivors {
                    top_failures: failures,
                },
                warnings,
                suggestion,
            ));
        }

        self.verify_and_rank(intent, spec, batch.attempts, warnings, ctx)
            .await
    }

    async fn verify_and_rank(
        &self,
        intent: &mut Intent,
        spec: Arc<Specification>,
        attempts: Vec<Attempt>,
        mut warnings: Vec<String>,
        ctx: &RunContext,
    ) -> PipelineResult<RunReport> {
        self.enter_phase(intent, IntentStatus::Verifying)?;
        let generated = attempts.len();

        let mut tasks: JoinSet<(Attempt, PipelineResult<Verification>)> = JoinSet::new();
        for attempt in attempts {
            self.store
                .update_attempt_status(&attempt.id, AttemptStatus::Verifying)?;
            let harness = Arc::clone(&self.harness);
            let spec = Arc::clone(&spec);
            let cancel = ctx.cancel.clone();
            tasks.spawn(async move {
                let verification = harness.verify(&attempt, &spec, &cancel).await;
                (attempt, verification)
            });
        }

        let mut verifications: Vec<Verification> = Vec::with_capacity(generated);
        let mut passing: Vec<(Attempt, Verification)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (attempt, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Verification task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(verification) => {
                    let status = if verification.passed {
                        AttemptStatus::Passed
                    } else {
                        AttemptStatus::Failed
                    };
                    self.store.update_attempt_status(&attempt.id, status)?;
                    self.store.put_verification(&verification)?;
                    self.emit(PipelineEvent::VerificationFinished {
                        intent_id: intent.id.clone(),
                        attempt_id: attempt.id.clone(),
                        verification_id: verification.id.clone(),
                        passed: verification.passed,
                        first_failure: verification.first_failure.clone(),
                        timestamp: Utc::now(),
                    });
                    if verification.passed {
                        passing.push((attempt, verification.clone()));
                    }
                    verifications.push(verification);
                }
                // One attempt's failure never fails its siblings; a
                // cancelled run unwinds after the drain
                Err(PipelineError::Cancelled) => continue,
                Err(e) => {
                    warn!(attempt_id = %attempt.id, error = %e, "Verification errored");
                    self.store
                        .update_attempt_status(&attempt.id, AttemptStatus::Failed)?;
                }
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Rank
        self.enter_phase(intent, IntentStatus::Ranking)?;
        let passed = passing.len();
        if passing.is_empty() {
            let top_failures = aggregate_failures(&verifications, TOP_FAILURE_CATEGORIES);
            let suggestion = no_survivors_suggestion(&top_failures);
            self.finish(intent, IntentStatus::Failed, Some("no_survivors"))?;
            let mut report = self.report(
                intent,
                RunOutcome::NoSurvivors { top_failures },
                warnings,
                suggestion,
            );
            report.attempts_generated = generated;
            return Ok(report);
        }

        let mut inputs = Vec::with_capacity(passing.len());
        for (attempt, verification) in passing {
            let readability = self.ranking.readability_score(&attempt, &ctx.cancel).await;
            inputs.push(RankInput {
                attempt,
                verification,
                readability,
            });
        }
        let survivors = self.ranking.rank(&intent.id, inputs);
        for survivor in &survivors {
            self.store.put_survivor(survivor)?;
        }
        self.emit(PipelineEvent::SurvivorsRanked {
            intent_id: intent.id.clone(),
            count: survivors.len(),
            low_diversity: warnings.iter().any(|w| w.contains("low diversity")),
            timestamp: Utc::now(),
        });

        // Judge: present and wait
        self.enter_phase(intent, IntentStatus::Judging)?;
        for survivor in &survivors {
            self.store.mark_presented(&survivor.id)?;
        }
        if intent.refinement_count >= self.config.refinement_warn_after
            && self.config.refinement_warn_after > 0
        {
            warnings.push(format!(
                "intent has been refined {} times; consider redirecting instead",
                intent.refinement_count
            ));
        }

        let mut report = self.report(
            intent,
            RunOutcome::AwaitingJudgment {
                survivor_count: survivors.len(),
            },
            warnings,
            None,
        );
        report.attempts_generated = generated;
        report.attempts_passed = passed;
        Ok(report)
    }

    // =========================================================================
    // Judgment handling
    // =========================================================================

    async fn handle_accept(
        &self,
        intent: &mut Intent,
        judgment: Judgment,
    ) -> PipelineResult<RunReport> {
        let survivor_id = judgment
            .survivor_id
            .clone()
            .ok_or_else(|| PipelineError::NotFound("accept without survivor id".into()))?;

        // Re-applying an already-applied intent is a refusal, not a rerun
        if intent.status == IntentStatus::Complete {
            warn!(intent_id = %intent.id, "Accept on completed intent refused (already applied)");
            return Ok(self.report(
                intent,
                RunOutcome::Applied {
                    survivor_id: survivor_id.clone(),
                },
                vec!["intent already complete; accept ignored".into()],
                None,
            ));
        }
        if intent.status != IntentStatus::Judging {
            return Err(PipelineError::InvalidTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Complete.to_string(),
            });
        }

        let survivor = self
            .store
            .get_survivor(&survivor_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("survivor {survivor_id}")))?;
        let attempt = self
            .store
            .get_attempt(&survivor.attempt_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("attempt {}", survivor.attempt_id)))?;

        crate::apply::apply_atomically(&self.project_root, &attempt.changes)?;
        self.store.put_judgment(&judgment)?;
        self.emit_judgment(&judgment);
        self.emit(PipelineEvent::ChangesApplied {
            intent_id: intent.id.clone(),
            survivor_id: survivor_id.clone(),
            file_count: attempt.changes.len(),
            timestamp: Utc::now(),
        });
        self.finish(intent, IntentStatus::Complete, None)?;
        Ok(self.report(
            intent,
            RunOutcome::Applied { survivor_id },
            Vec::new(),
            None,
        ))
    }

    async fn handle_refine(
        &self,
        mut intent: Intent,
        judgment: Judgment,
    ) -> PipelineResult<RunReport> {
        let text = judgment
            .refinement
            .clone()
            .ok_or_else(|| PipelineError::NotFound("refine without text".into()))?;
        if intent.status != IntentStatus::Judging {
            return Err(PipelineError::InvalidTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Compiling.to_string(),
            });
        }
        self.store.put_judgment(&judgment)?;
        self.emit_judgment(&judgment);

        // Prior survivors stay in the store, presented but never reused
        intent.apply_refinement(&text);
        intent.parsed = None;
        self.store.update_intent_status(&intent)?;
        info!(
            intent_id = %intent.id,
            refinement_count = intent.refinement_count,
            "Refinement accepted; recompiling"
        );
        self.run_pipeline(intent).await
    }

    async fn handle_redirect(
        &self,
        mut intent: Intent,
        judgment: Judgment,
    ) -> PipelineResult<RunReport> {
        let text = judgment
            .redirect
            .clone()
            .ok_or_else(|| PipelineError::NotFound("redirect without text".into()))?;
        self.store.put_judgment(&judgment)?;
        self.emit_judgment(&judgment);
        let session_id = intent.session_id.clone();
        self.finish(&mut intent, IntentStatus::Aborted, Some("redirected"))?;
        self.submit(&text, &session_id).await
    }

    // =========================================================================
    // Resumption
    // =========================================================================

    async fn resume_intent(&self, mut intent: Intent) -> PipelineResult<RunReport> {
        let ctx = RunContext::new(self.cancel.child_token());
        match intent.status {
            IntentStatus::Parsing | IntentStatus::Compiling => self.run_pipeline(intent).await,
            IntentStatus::Clarifying => {
                let questions = intent
                    .parsed
                    .as_ref()
                    .map(|p| p.unclear.clone())
                    .unwrap_or_default();
                Ok(self.report(
                    &intent,
                    RunOutcome::ClarificationNeeded { questions },
                    Vec::new(),
                    None,
                ))
            }
            IntentStatus::Generating | IntentStatus::Verifying | IntentStatus::Ranking => {
                // Workspace-bound phases restart from their persisted
                // input; the explicit restart rewinds the status so the
                // re-run's transitions stay forward-only
                let Some(spec) = self.store.latest_spec(&intent.id)? else {
                    return self.run_pipeline(intent).await;
                };
                intent.status = IntentStatus::Generating;
                intent.updated_at = Utc::now();
                self.store.update_intent_status(&intent)?;
                let attempts = self.store.list_attempts(&spec.id, spec.version)?;
                let usable: Vec<Attempt> = attempts
                    .into_iter()
                    .filter(|a| a.status != AttemptStatus::Discarded)
                    .collect();
                let result = if usable.is_empty() {
                    self.run_from_generation(&mut intent, spec, &ctx).await
                } else {
                    self.verify_and_rank(&mut intent, Arc::new(spec), usable, Vec::new(), &ctx)
                        .await
                };
                match result {
                    Err(PipelineError::Cancelled) => {
                        self.finish(&mut intent, IntentStatus::Aborted, Some("cancelled"))?;
                        Ok(self.report(&intent, RunOutcome::Aborted, Vec::new(), None))
                    }
                    other => other,
                }
            }
            IntentStatus::Judging => {
                let survivors = self.store.list_survivors_for_intent(&intent.id)?;
                Ok(self.report(
                    &intent,
                    RunOutcome::AwaitingJudgment {
                        survivor_count: survivors.len(),
                    },
                    Vec::new(),
                    None,
                ))
            }
            // Terminal states are filtered out before this point
            IntentStatus::Complete | IntentStatus::Failed | IntentStatus::Aborted => Ok(self
                .report(
                    &intent,
                    RunOutcome::Aborted,
                    vec!["intent already terminal".into()],
                    None,
                )),
        }
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Persist a phase transition before the phase's side effects begin.
    ///
    /// Also the cooperative abort check: an intent marked aborted in the
    /// store (by another process) stops at the next boundary.
    fn enter_phase(&self, intent: &mut Intent, status: IntentStatus) -> PipelineResult<()> {
        if let Some(stored) = self.store.get_intent(&intent.id)? {
            if stored.status == IntentStatus::Aborted {
                return Err(PipelineError::Cancelled);
            }
        }
        if intent.status != status && !intent.status.can_transition_to(status) {
            return Err(PipelineError::InvalidTransition {
                from: intent.status.to_string(),
                to: status.to_string(),
            });
        }
        intent.status = status;
        intent.updated_at = Utc::now();
        self.store.update_intent_status(intent)?;
        self.emit(PipelineEvent::PhaseEntered {
            intent_id: intent.id.clone(),
            phase: status,
            timestamp: Utc::now(),
        });
        info!(intent_id = %intent.id, phase = %status, "Phase entered");
        Ok(())
    }

    fn finish(
        &self,
        intent: &mut Intent,
        status: IntentStatus,
        reason: Option<&str>,
    ) -> PipelineResult<()> {
        if intent.status.is_terminal() {
            return Ok(());
        }
        intent.status = status;
        intent.updated_at = Utc::now();
        self.store.update_intent_status(intent)?;
        self.emit(PipelineEvent::IntentFinished {
            intent_id: intent.id.clone(),
            status,
            reason: reason.map(|r| r.to_string()),
            timestamp: Utc::now(),
        });
        info!(intent_id = %intent.id, status = %status, reason = reason.unwrap_or("-"), "Intent finished");
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.store.append_event(event.intent_id(), &event) {
            warn!(error = %e, "Failed to persist event");
        }
        self.log.append(&event);
    }

    fn emit_judgment(&self, judgment: &Judgment) {
        self.emit(PipelineEvent::JudgmentRecorded {
            intent_id: judgment.intent_id.clone(),
            decision: judgment.decision,
            survivor_id: judgment.survivor_id.clone(),
            timestamp: Utc::now(),
        });
    }

    fn require_intent(&self, intent_id: &str) -> PipelineResult<Intent> {
        self.store
            .get_intent(intent_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("intent {intent_id}")))
    }

    fn report(
        &self,
        intent: &Intent,
        outcome: RunOutcome,
        warnings: Vec<String>,
        suggestion: Option<String>,
    ) -> RunReport {
        RunReport {
            intent_id: intent.id.clone(),
            session_id: intent.session_id.clone(),
            phase: intent.status,
            outcome,
            attempts_generated: 0,
            attempts_passed: 0,
            cost_usd: self.gateway.total_cost_usd(),
            warnings,
            suggestion,
        }
    }
}

fn preview(message: &str) -> String {
    const MAX: usize = 120;
    if message.len() <= MAX {
        message.to_string()
    } else {
        let mut end = MAX;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &message[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(300);
        let p = preview(&long);
        assert!(p.len() < 130);
        assert!(p.ends_with("..."));
    }
}
