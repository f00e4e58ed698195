//! Pure state transitions and stop-condition evaluation.
//!
//! Nothing here performs I/O. Each `update_state_*` function takes the current
//! [`RepairLoopState`] and returns the next one.
//!
//! Budget accounting rule: [`update_state_after_diff_applied`] is the only
//! transition that decrements `repair_remaining`. Failures, empty diffs,
//! timeouts, and collaborator errors never spend budget.

use crate::config::RepairPolicy;
use crate::repair::decision::StopReason;
use crate::repair::state::RepairLoopState;
use crate::repair::tracker::ConsecutiveFailureTracker;

/// Number of consecutive unusable diffs that ends the loop.
pub const EMPTY_DIFF_LIMIT: u32 = 2;

/// Observations from the current stage fed into [`check_stop_conditions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSignals {
    /// Latest classification is not code-fixable.
    pub is_tooling_env_failure: bool,
    /// Human denied a scope expansion.
    pub scope_expansion_denied: bool,
    /// Consecutive empty or unusable diffs.
    pub empty_diff_count: u32,
    /// Diagnosis just timed out.
    pub diagnosis_timed_out: bool,
    /// Diff generation just timed out.
    pub diff_gen_timed_out: bool,
}

/// Outcome of [`check_stop_conditions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCheck {
    pub should_stop: bool,
    pub reason: Option<StopReason>,
}

impl StopCheck {
    fn proceed() -> Self {
        Self {
            should_stop: false,
            reason: None,
        }
    }

    fn stop(reason: StopReason) -> Self {
        Self {
            should_stop: true,
            reason: Some(reason),
        }
    }
}

/// Outcome of a timeout transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutOutcome {
    pub state: RepairLoopState,
    pub should_retry: bool,
}

/// Fresh state for a new task: full budget, zeroed counters, cleared flags.
#[must_use]
pub fn create_repair_loop_state(policy: &RepairPolicy) -> RepairLoopState {
    RepairLoopState {
        repair_remaining: policy.max_repair_iterations,
        ..RepairLoopState::default()
    }
}

/// Evaluate stop conditions in priority order.
///
/// Cancellation is checked by the caller before this runs. The remaining order
/// is: tooling/env failure, scope denial, budget, repeated failure, empty diff
/// limit, second consecutive stage timeout. Environmental conditions come
/// first since no remaining budget can repair a broken toolchain.
#[must_use]
pub fn check_stop_conditions(
    state: &RepairLoopState,
    policy: &RepairPolicy,
    signals: &StopSignals,
) -> StopCheck {
    if signals.is_tooling_env_failure {
        return StopCheck::stop(StopReason::ToolingEnvFailure);
    }
    if signals.scope_expansion_denied {
        return StopCheck::stop(StopReason::ScopeExpansionDenied);
    }
    if !state.has_budget() {
        return StopCheck::stop(StopReason::BudgetExhausted);
    }
    if state.consecutive_same_failure >= policy.max_consecutive_same_failure {
        return StopCheck::stop(StopReason::RepeatedFailure);
    }
    if signals.empty_diff_count >= EMPTY_DIFF_LIMIT {
        return StopCheck::stop(StopReason::EmptyDiffExhausted);
    }
    if (signals.diagnosis_timed_out && state.diagnosis_timeout_retried)
        || (signals.diff_gen_timed_out && state.diff_gen_timeout_retried)
    {
        return StopCheck::stop(StopReason::DiagnosisTimeout);
    }
    StopCheck::proceed()
}

/// Record a failure signature using the tracker's streak semantics.
#[must_use]
pub fn update_state_after_failure(state: &RepairLoopState, signature: &str) -> RepairLoopState {
    let mut tracker = ConsecutiveFailureTracker::from_parts(
        state.consecutive_same_failure,
        state.previous_failure_signature.clone(),
    );
    tracker.record_failure(signature);
    let (count, previous) = tracker.into_parts();

    RepairLoopState {
        consecutive_same_failure: count,
        previous_failure_signature: previous,
        ..state.clone()
    }
}

/// Spend one unit of budget for a cleanly applied diff.
#[must_use]
pub fn update_state_after_diff_applied(state: &RepairLoopState) -> RepairLoopState {
    RepairLoopState {
        repair_remaining: state.repair_remaining.saturating_sub(1),
        current_iteration: state.current_iteration + 1,
        diagnosis_timeout_retried: false,
        diff_gen_timeout_retried: false,
        pending_scope_files: Vec::new(),
        ..state.clone()
    }
}

/// Handle a diagnosis timeout: one free retry, then escalate.
#[must_use]
pub fn update_state_after_diagnosis_timeout(
    state: &RepairLoopState,
    policy: &RepairPolicy,
) -> TimeoutOutcome {
    let should_retry = policy.timeout_retry_once && !state.diagnosis_timeout_retried;
    TimeoutOutcome {
        state: RepairLoopState {
            diagnosis_timeout_retried: true,
            ..state.clone()
        },
        should_retry,
    }
}

/// Handle a diff generation timeout: one free retry, then escalate.
#[must_use]
pub fn update_state_after_diff_gen_timeout(
    state: &RepairLoopState,
    policy: &RepairPolicy,
) -> TimeoutOutcome {
    let should_retry = policy.timeout_retry_once && !state.diff_gen_timeout_retried;
    TimeoutOutcome {
        state: RepairLoopState {
            diff_gen_timeout_retried: true,
            ..state.clone()
        },
        should_retry,
    }
}

/// Remember files a proposal wants to touch outside the allowed set.
#[must_use]
pub fn update_state_with_pending_scope(
    state: &RepairLoopState,
    files: Vec<String>,
) -> RepairLoopState {
    RepairLoopState {
        pending_scope_files: files,
        ..state.clone()
    }
}

/// Clear pending scope files after a decision.
#[must_use]
pub fn clear_pending_scope(state: &RepairLoopState) -> RepairLoopState {
    RepairLoopState {
        pending_scope_files: Vec::new(),
        ..state.clone()
    }
}

/// Human-approved budget extension (`retry_repair_one_more`).
///
/// Raises the budget and clears the failure streak so the resumed loop gets a
/// genuine attempt before repeat detection fires again.
#[must_use]
pub fn grant_budget_extension(state: &RepairLoopState, extra: u32) -> RepairLoopState {
    RepairLoopState {
        repair_remaining: state.repair_remaining.saturating_add(extra),
        consecutive_same_failure: 0,
        previous_failure_signature: None,
        ..state.clone()
    }
}
