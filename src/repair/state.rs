//! Repair loop state.
//!
//! [`RepairLoopState`] is an immutable value: every transition in
//! [`policy`](super::policy) takes a state by reference and returns a new one.
//! Observers can therefore hold snapshots without racing the loop.

use serde::{Deserialize, Serialize};

/// Stage of the repair runner's state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStage {
    #[default]
    Idle,
    Classifying,
    Diagnosing,
    GeneratingDiff,
    AwaitingScopeApproval,
    ApplyingDiff,
    Reverifying,
}

impl RunnerStage {
    /// Snake-case identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Classifying => "classifying",
            Self::Diagnosing => "diagnosing",
            Self::GeneratingDiff => "generating_diff",
            Self::AwaitingScopeApproval => "awaiting_scope_approval",
            Self::ApplyingDiff => "applying_diff",
            Self::Reverifying => "reverifying",
        }
    }
}

impl std::fmt::Display for RunnerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task state of the self-correction loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairLoopState {
    /// Remaining repair budget.
    pub repair_remaining: u32,
    /// Number of diffs applied so far.
    pub current_iteration: u32,
    /// Length of the current identical-failure streak.
    pub consecutive_same_failure: u32,
    /// Signature of the most recent failure.
    pub previous_failure_signature: Option<String>,
    /// The free diagnosis timeout retry has been used.
    pub diagnosis_timeout_retried: bool,
    /// The free diff generation timeout retry has been used.
    pub diff_gen_timeout_retried: bool,
    /// Out-of-scope files awaiting a human decision.
    pub pending_scope_files: Vec<String>,
}

impl RepairLoopState {
    /// Whether any budget is left.
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.repair_remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_has_no_budget() {
        let state = RepairLoopState::default();
        assert!(!state.has_budget());
        assert!(state.pending_scope_files.is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(RunnerStage::GeneratingDiff.to_string(), "generating_diff");
        assert_eq!(RunnerStage::default(), RunnerStage::Idle);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = RepairLoopState {
            repair_remaining: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["repairRemaining"], 2);
        assert_eq!(json["diagnosisTimeoutRetried"], false);
        assert!(json["previousFailureSignature"].is_null());
    }
}
