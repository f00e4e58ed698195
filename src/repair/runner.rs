//! Bounded self-correction runner.
//!
//! Drives one repair loop per task:
//!
//! ```text
//! CLASSIFYING ──not fixable──> stop
//!      │
//!      v
//! DIAGNOSING ──timeout──> retry once / stop
//!      │
//!      v
//! GENERATING_DIFF ──timeout──> retry once / stop
//!      │        └──empty diff twice──> stop
//!      v
//! AWAITING_SCOPE_APPROVAL (only for out-of-scope files)
//!      │
//!      v
//! APPLYING_DIFF ──> REVERIFYING ──fail──> CLASSIFYING
//!                        └──pass──> done
//! ```
//!
//! Stages run strictly in sequence. Cancellation is cooperative: the token is
//! polled at every stage boundary, and only the unbounded scope-approval wait
//! races against it. A stage already in flight always completes, so a diff is
//! never half applied.

use crate::config::RepairPolicy;
use crate::error::{MendError, Result};
use crate::repair::cancel::CancellationToken;
use crate::repair::classifier::{classify_failure, FailureClassification};
use crate::repair::collaborators::{
    ApprovalDecision, ApprovalManager, ApprovalRequest, ApprovalType, RepairAttempt,
    RepairCapabilities, RepairContext, TestFailureInput,
};
use crate::repair::decision::{generate_decision_options, DecisionContext, StopReason};
use crate::repair::events::{EventSink, RepairEvent, StopEvent, TracingEventSink};
use crate::repair::policy::{
    check_stop_conditions, clear_pending_scope, create_repair_loop_state,
    grant_budget_extension, update_state_after_diagnosis_timeout,
    update_state_after_diff_applied, update_state_after_diff_gen_timeout,
    update_state_after_failure, update_state_with_pending_scope, StopSignals, TimeoutOutcome,
    EMPTY_DIFF_LIMIT,
};
use crate::repair::scope::AllowedFiles;
use crate::repair::state::{RepairLoopState, RunnerStage};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of one stage: keep going, stop for a reason, or a collaborator broke.
enum Flow<T> {
    Proceed(T),
    Stop(StopReason),
    Broken(FailureClassification),
}

enum ApprovalOutcome {
    Approved,
    Denied,
    Cancelled,
    Failed(anyhow::Error),
}

/// Owns the repair loop for a single task.
pub struct SelfCorrectionRunner {
    task_id: String,
    policy: RepairPolicy,
    capabilities: RepairCapabilities,
    approvals: Option<Arc<dyn ApprovalManager>>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    state_tx: watch::Sender<RepairLoopState>,
    stage_tx: watch::Sender<RunnerStage>,
    running: AtomicBool,
    history: Mutex<Vec<RepairAttempt>>,
}

/// Clears the running flag when a loop exits by any path.
struct RunningGuard<'a> {
    runner: &'a SelfCorrectionRunner,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.runner.stage_tx.send_replace(RunnerStage::Idle);
        self.runner.running.store(false, Ordering::SeqCst);
    }
}

impl SelfCorrectionRunner {
    /// Create a runner for `task_id`.
    ///
    /// Events go to the tracing log and scope expansions are denied until
    /// [`with_event_sink`](Self::with_event_sink) and
    /// [`with_approval_manager`](Self::with_approval_manager) say otherwise.
    pub fn new(
        task_id: impl Into<String>,
        policy: RepairPolicy,
        capabilities: RepairCapabilities,
    ) -> Self {
        let (state_tx, _) = watch::channel(create_repair_loop_state(&policy));
        let (stage_tx, _) = watch::channel(RunnerStage::Idle);
        Self {
            task_id: task_id.into(),
            policy,
            capabilities,
            approvals: None,
            events: Arc::new(TracingEventSink),
            cancel: CancellationToken::new(),
            state_tx,
            stage_tx,
            running: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_approval_manager(mut self, approvals: Arc<dyn ApprovalManager>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Share an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.policy
    }

    /// Snapshot of the current loop state.
    #[must_use]
    pub fn state(&self) -> RepairLoopState {
        self.state_tx.borrow().clone()
    }

    /// Receive every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RepairLoopState> {
        self.state_tx.subscribe()
    }

    /// Stage the runner is currently in.
    #[must_use]
    pub fn stage(&self) -> RunnerStage {
        *self.stage_tx.borrow()
    }

    /// Repairs applied so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RepairAttempt> {
        self.lock_history().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        info!(task = %self.task_id, "Repair loop cancellation requested");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the repair loop from a fresh state.
    ///
    /// Returns `Ok(None)` when re-verification passes, otherwise the terminal
    /// [`StopEvent`].
    ///
    /// # Errors
    ///
    /// Only internal defects: an invalid policy, or a loop already running on
    /// this runner. Collaborator failures become a `tooling_env_failure` stop.
    pub async fn start_repair_loop(
        &self,
        initial_failure: TestFailureInput,
        allowed_files: &[String],
        test_command: &str,
    ) -> Result<Option<StopEvent>> {
        let _guard = self.acquire()?;
        self.policy.validate()?;

        self.publish_state(create_repair_loop_state(&self.policy));
        self.lock_history().clear();

        info!(
            task = %self.task_id,
            budget = self.policy.max_repair_iterations,
            "Starting repair loop for `{}`",
            test_command
        );
        let scope = AllowedFiles::new(allowed_files.iter().cloned());
        Ok(self.run_loop(initial_failure, scope, test_command).await)
    }

    /// Resume after a human granted `extra_budget` more repairs.
    ///
    /// State and history from the previous run are kept.
    ///
    /// # Errors
    ///
    /// Same as [`start_repair_loop`](Self::start_repair_loop).
    pub async fn continue_repair_loop(
        &self,
        failure: TestFailureInput,
        allowed_files: &[String],
        test_command: &str,
        extra_budget: u32,
    ) -> Result<Option<StopEvent>> {
        let _guard = self.acquire()?;
        self.policy.validate()?;

        let state = grant_budget_extension(&self.state(), extra_budget);
        info!(
            task = %self.task_id,
            remaining = state.repair_remaining,
            "Resuming repair loop with extended budget"
        );
        self.publish_state(state);
        let scope = AllowedFiles::new(allowed_files.iter().cloned());
        Ok(self.run_loop(failure, scope, test_command).await)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    async fn run_loop(
        &self,
        initial: TestFailureInput,
        mut scope: AllowedFiles,
        test_command: &str,
    ) -> Option<StopEvent> {
        let mut state = self.state();
        let mut current = initial;
        let mut last_failure: Option<FailureClassification> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Some(self.stop(&state, StopReason::MissionCancelled, last_failure, test_command));
            }

            self.set_stage(RunnerStage::Classifying);
            if current.passed() {
                info!(task = %self.task_id, iteration = state.current_iteration, "Verification passed");
                self.publish(RepairEvent::VerificationPassed {
                    task_id: self.task_id.clone(),
                    iteration: state.current_iteration,
                });
                return None;
            }

            let classification = classify_failure(&current.raw_output);
            self.publish(RepairEvent::FailureClassified {
                task_id: self.task_id.clone(),
                iteration: state.current_iteration,
                classification: classification.clone(),
            });
            state = update_state_after_failure(&state, &classification.failure_signature);
            self.publish_state(state.clone());
            last_failure = Some(classification.clone());

            let signals = StopSignals {
                is_tooling_env_failure: !classification.is_code_fixable,
                ..Default::default()
            };
            if let Some(reason) = check_stop_conditions(&state, &self.policy, &signals).reason {
                return Some(self.stop(&state, reason, last_failure, test_command));
            }

            match self
                .attempt_repair(&mut state, &mut scope, &classification, &current, test_command)
                .await
            {
                Flow::Proceed(()) => {}
                Flow::Stop(reason) => {
                    return Some(self.stop(&state, reason, last_failure, test_command))
                }
                Flow::Broken(synthetic) => {
                    return Some(self.stop(
                        &state,
                        StopReason::ToolingEnvFailure,
                        Some(synthetic),
                        test_command,
                    ))
                }
            }

            if self.cancel.is_cancelled() {
                return Some(self.stop(&state, StopReason::MissionCancelled, last_failure, test_command));
            }

            if !self.policy.allow_auto_rerun_allowlisted_tests {
                let outcome = self
                    .request_approval(
                        ApprovalType::TestRerun,
                        RunnerStage::Reverifying,
                        format!("Re-run `{}` after repair", test_command),
                        serde_json::json!({ "command": test_command }),
                    )
                    .await;
                match outcome {
                    ApprovalOutcome::Approved => {}
                    ApprovalOutcome::Denied | ApprovalOutcome::Cancelled => {
                        return Some(self.stop(
                            &state,
                            StopReason::MissionCancelled,
                            last_failure,
                            test_command,
                        ))
                    }
                    ApprovalOutcome::Failed(e) => {
                        let synthetic = self.collaborator_failure(&state, RunnerStage::Reverifying, &e);
                        return Some(self.stop(
                            &state,
                            StopReason::ToolingEnvFailure,
                            Some(synthetic),
                            test_command,
                        ));
                    }
                }
            }

            self.set_stage(RunnerStage::Reverifying);
            debug!(task = %self.task_id, "Re-running verification");
            match self.capabilities.test_runner.run_test().await {
                Ok(result) => current = result,
                Err(e) => {
                    let synthetic = self.collaborator_failure(&state, RunnerStage::Reverifying, &e);
                    return Some(self.stop(
                        &state,
                        StopReason::ToolingEnvFailure,
                        Some(synthetic),
                        test_command,
                    ));
                }
            }
        }
    }

    /// One repair attempt: diagnose, generate, approve scope, apply.
    ///
    /// `Proceed` means verification should run again.
    async fn attempt_repair(
        &self,
        state: &mut RepairLoopState,
        scope: &mut AllowedFiles,
        failure: &FailureClassification,
        input: &TestFailureInput,
        test_command: &str,
    ) -> Flow<()> {
        self.publish(RepairEvent::RepairAttemptStarted {
            task_id: self.task_id.clone(),
            iteration: state.current_iteration + 1,
            repair_remaining: state.repair_remaining,
        });

        let mut context = RepairContext {
            task_id: self.task_id.clone(),
            failure: failure.clone(),
            raw_output: input.raw_output.clone(),
            test_command: test_command.to_string(),
            allowed_files: scope.entries().to_vec(),
            history: self.history(),
            diagnosis: None,
        };

        let generator = Arc::clone(&self.capabilities.diff_generator);
        let diagnosis = match self
            .with_timeout_retry(
                state,
                RunnerStage::Diagnosing,
                self.policy.diagnosis_timeout(),
                update_state_after_diagnosis_timeout,
                || generator.diagnose(&context),
            )
            .await
        {
            Flow::Proceed(d) => d,
            Flow::Stop(reason) => return Flow::Stop(reason),
            Flow::Broken(c) => return Flow::Broken(c),
        };
        self.publish(RepairEvent::DiagnosisCompleted {
            task_id: self.task_id.clone(),
            iteration: state.current_iteration + 1,
            root_cause: diagnosis.root_cause.clone(),
        });
        context.diagnosis = Some(diagnosis);

        let mut unusable = 0u32;
        loop {
            let mut proposal = match self
                .with_timeout_retry(
                    state,
                    RunnerStage::GeneratingDiff,
                    self.policy.diff_gen_timeout(),
                    update_state_after_diff_gen_timeout,
                    || generator.generate_diff(&context),
                )
                .await
            {
                Flow::Proceed(p) => p,
                Flow::Stop(reason) => return Flow::Stop(reason),
                Flow::Broken(c) => return Flow::Broken(c),
            };
            proposal.files_affected = proposal.touched_files();

            self.publish(RepairEvent::DiffProposed {
                task_id: self.task_id.clone(),
                iteration: state.current_iteration + 1,
                diff_id: proposal.diff_id.clone(),
                files_affected: proposal.files_affected.clone(),
                empty: proposal.is_empty(),
            });

            if proposal.is_empty() {
                unusable += 1;
                if let Some(reason) = self.unusable_diff_stop(state, unusable) {
                    return Flow::Stop(reason);
                }
                warn!(
                    task = %self.task_id,
                    "Empty repair diff ({}/{}), regenerating",
                    unusable,
                    EMPTY_DIFF_LIMIT
                );
                continue;
            }

            let outside = scope.out_of_scope(&proposal.files_affected);
            if !outside.is_empty() {
                *state = update_state_with_pending_scope(state, outside.clone());
                self.publish_state(state.clone());
                self.publish(RepairEvent::ScopeExpansionRequested {
                    task_id: self.task_id.clone(),
                    iteration: state.current_iteration + 1,
                    diff_id: proposal.diff_id.clone(),
                    files: outside.clone(),
                });
                self.set_stage(RunnerStage::AwaitingScopeApproval);
                info!(
                    task = %self.task_id,
                    "Repair diff touches files outside scope: {}",
                    outside.join(", ")
                );

                let outcome = self
                    .request_approval(
                        ApprovalType::ScopeExpansion,
                        RunnerStage::AwaitingScopeApproval,
                        format!("Allow repair to modify {}", outside.join(", ")),
                        serde_json::json!({
                            "diffId": proposal.diff_id,
                            "files": outside,
                            "summary": proposal.summary,
                        }),
                    )
                    .await;

                match outcome {
                    ApprovalOutcome::Approved => {
                        scope.extend(&outside);
                        context.allowed_files = scope.entries().to_vec();
                        *state = clear_pending_scope(state);
                        self.publish_state(state.clone());
                    }
                    ApprovalOutcome::Denied if self.policy.stop_on_scope_expansion_denied => {
                        let signals = StopSignals {
                            scope_expansion_denied: true,
                            ..Default::default()
                        };
                        let reason = check_stop_conditions(state, &self.policy, &signals)
                            .reason
                            .unwrap_or(StopReason::ScopeExpansionDenied);
                        return Flow::Stop(reason);
                    }
                    ApprovalOutcome::Denied => {
                        *state = clear_pending_scope(state);
                        self.publish_state(state.clone());
                        unusable += 1;
                        if let Some(reason) = self.unusable_diff_stop(state, unusable) {
                            return Flow::Stop(reason);
                        }
                        warn!(task = %self.task_id, "Scope expansion denied, regenerating diff");
                        continue;
                    }
                    ApprovalOutcome::Cancelled => return Flow::Stop(StopReason::MissionCancelled),
                    ApprovalOutcome::Failed(e) => {
                        return Flow::Broken(self.collaborator_failure(
                            state,
                            RunnerStage::AwaitingScopeApproval,
                            &e,
                        ))
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return Flow::Stop(StopReason::MissionCancelled);
            }

            self.set_stage(RunnerStage::ApplyingDiff);
            match self.capabilities.diff_applicator.apply_diff(&proposal).await {
                Ok(true) => {
                    *state = update_state_after_diff_applied(state);
                    self.publish_state(state.clone());
                    self.lock_history().push(RepairAttempt {
                        iteration: state.current_iteration,
                        diff_id: proposal.diff_id.clone(),
                        summary: proposal.summary.clone(),
                        files_affected: proposal.files_affected.clone(),
                        failure_signature: failure.failure_signature.clone(),
                    });
                    self.publish(RepairEvent::DiffApplied {
                        task_id: self.task_id.clone(),
                        iteration: state.current_iteration,
                        diff_id: proposal.diff_id.clone(),
                        repair_remaining: state.repair_remaining,
                    });
                    info!(
                        task = %self.task_id,
                        iteration = state.current_iteration,
                        remaining = state.repair_remaining,
                        "Applied repair diff {}",
                        proposal.diff_id
                    );
                    return Flow::Proceed(());
                }
                Ok(false) if self.policy.stop_on_repeated_stale_context => {
                    unusable += 1;
                    if let Some(reason) = self.unusable_diff_stop(state, unusable) {
                        return Flow::Stop(reason);
                    }
                    warn!(
                        task = %self.task_id,
                        "Diff {} did not apply cleanly, regenerating",
                        proposal.diff_id
                    );
                }
                Ok(false) => {
                    warn!(
                        task = %self.task_id,
                        "Diff {} did not apply cleanly, re-verifying without spending budget",
                        proposal.diff_id
                    );
                    return Flow::Proceed(());
                }
                Err(e) => {
                    return Flow::Broken(self.collaborator_failure(
                        state,
                        RunnerStage::ApplyingDiff,
                        &e,
                    ))
                }
            }
        }
    }

    /// Run a generator call under its stage timeout with one free retry.
    async fn with_timeout_retry<T, F, Fut>(
        &self,
        state: &mut RepairLoopState,
        stage: RunnerStage,
        timeout: Duration,
        on_timeout: fn(&RepairLoopState, &RepairPolicy) -> TimeoutOutcome,
        call: F,
    ) -> Flow<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Flow::Stop(StopReason::MissionCancelled);
            }
            self.set_stage(stage);

            match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Flow::Proceed(value),
                Ok(Err(e)) => return Flow::Broken(self.collaborator_failure(state, stage, &e)),
                Err(_elapsed) => {
                    let outcome = on_timeout(state, &self.policy);
                    *state = outcome.state;
                    self.publish_state(state.clone());
                    self.publish(RepairEvent::StageTimedOut {
                        task_id: self.task_id.clone(),
                        stage,
                        will_retry: outcome.should_retry,
                    });

                    if outcome.should_retry {
                        warn!(
                            task = %self.task_id,
                            "{} timed out after {}ms, retrying once",
                            stage,
                            timeout.as_millis()
                        );
                        continue;
                    }

                    let signals = StopSignals {
                        diagnosis_timed_out: stage == RunnerStage::Diagnosing,
                        diff_gen_timed_out: stage == RunnerStage::GeneratingDiff,
                        ..Default::default()
                    };
                    let reason = check_stop_conditions(state, &self.policy, &signals)
                        .reason
                        .unwrap_or(StopReason::DiagnosisTimeout);
                    return Flow::Stop(reason);
                }
            }
        }
    }

    fn unusable_diff_stop(&self, state: &RepairLoopState, count: u32) -> Option<StopReason> {
        let signals = StopSignals {
            empty_diff_count: count,
            ..Default::default()
        };
        check_stop_conditions(state, &self.policy, &signals).reason
    }

    /// Ask for approval, racing the wait against cancellation.
    async fn request_approval(
        &self,
        approval_type: ApprovalType,
        stage: RunnerStage,
        description: String,
        context: serde_json::Value,
    ) -> ApprovalOutcome {
        let Some(approvals) = &self.approvals else {
            warn!(
                task = %self.task_id,
                "No approval manager configured, treating {:?} request as denied",
                approval_type
            );
            return ApprovalOutcome::Denied;
        };

        let request = ApprovalRequest {
            task_id: self.task_id.clone(),
            mode: "repair".to_string(),
            stage,
            approval_type,
            description,
            context,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ApprovalOutcome::Cancelled,
            result = approvals.request_approval(request) => match result {
                Ok(ApprovalDecision::Approved) => ApprovalOutcome::Approved,
                Ok(ApprovalDecision::Denied) => ApprovalOutcome::Denied,
                Err(e) => ApprovalOutcome::Failed(e),
            },
        }
    }

    /// Map a collaborator error to a synthetic tooling classification.
    fn collaborator_failure(
        &self,
        state: &RepairLoopState,
        stage: RunnerStage,
        error: &anyhow::Error,
    ) -> FailureClassification {
        warn!(task = %self.task_id, "Collaborator failed during {}: {:#}", stage, error);
        let classification = FailureClassification::tooling_env(&format!("{stage}: {error:#}"));
        self.publish(RepairEvent::FailureClassified {
            task_id: self.task_id.clone(),
            iteration: state.current_iteration,
            classification: classification.clone(),
        });
        classification
    }

    fn stop(
        &self,
        state: &RepairLoopState,
        reason: StopReason,
        last_failure: Option<FailureClassification>,
        test_command: &str,
    ) -> StopEvent {
        let context = DecisionContext {
            repair_remaining: state.repair_remaining,
            pending_scope_files: state.pending_scope_files.clone(),
            failure_type: last_failure.as_ref().map(|f| f.failure_type),
            test_command: Some(test_command.to_string()),
        };
        let stop = StopEvent {
            task_id: self.task_id.clone(),
            reason,
            decision_options: generate_decision_options(reason, &context),
            iteration: state.current_iteration,
            repair_remaining: state.repair_remaining,
            last_failure,
            timestamp: Utc::now(),
        };
        info!(
            task = %self.task_id,
            reason = %reason,
            iteration = state.current_iteration,
            remaining = state.repair_remaining,
            "Repair loop stopped: {}",
            reason.description()
        );
        self.publish(RepairEvent::RepairLoopStopped(stop.clone()));
        stop
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn acquire(&self) -> Result<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MendError::LoopAlreadyRunning {
                task_id: self.task_id.clone(),
            })?;
        Ok(RunningGuard { runner: self })
    }

    fn publish(&self, event: RepairEvent) {
        self.events.publish(event);
    }

    fn publish_state(&self, state: RepairLoopState) {
        self.state_tx.send_replace(state);
    }

    fn set_stage(&self, stage: RunnerStage) {
        debug!(task = %self.task_id, "Stage: {}", stage);
        self.stage_tx.send_replace(stage);
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<RepairAttempt>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SelfCorrectionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfCorrectionRunner")
            .field("task_id", &self.task_id)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .field("stage", &self.stage())
            .finish_non_exhaustive()
    }
}
