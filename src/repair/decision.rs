//! Stop reasons and the human decision menu.
//!
//! Every terminal stop is paired with a non-empty, reason-specific list of
//! [`DecisionOption`]s. The menu is fixed per reason; only descriptions pick up
//! details from the [`DecisionContext`].

use crate::error::MendError;
use crate::repair::classifier::FailureType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Canonical terminal condition of the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    RepeatedFailure,
    ToolingEnvFailure,
    ScopeExpansionDenied,
    EmptyDiffExhausted,
    DiagnosisTimeout,
    MissionCancelled,
}

impl StopReason {
    /// Snake-case identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetExhausted => "budget_exhausted",
            Self::RepeatedFailure => "repeated_failure",
            Self::ToolingEnvFailure => "tooling_env_failure",
            Self::ScopeExpansionDenied => "scope_expansion_denied",
            Self::EmptyDiffExhausted => "empty_diff_exhausted",
            Self::DiagnosisTimeout => "diagnosis_timeout",
            Self::MissionCancelled => "mission_cancelled",
        }
    }

    /// Human-readable explanation.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::BudgetExhausted => "Repair budget exhausted",
            Self::RepeatedFailure => "The same failure repeated after repair",
            Self::ToolingEnvFailure => "Tooling or environment failure that code changes cannot fix",
            Self::ScopeExpansionDenied => "Repair needs files outside the allowed scope",
            Self::EmptyDiffExhausted => "No usable repair diff could be produced",
            Self::DiagnosisTimeout => "Repair generation timed out twice",
            Self::MissionCancelled => "Repair loop cancelled",
        }
    }

    /// All reasons, in stop-check priority order.
    #[must_use]
    pub fn all() -> [Self; 7] {
        [
            Self::MissionCancelled,
            Self::ToolingEnvFailure,
            Self::ScopeExpansionDenied,
            Self::BudgetExhausted,
            Self::RepeatedFailure,
            Self::EmptyDiffExhausted,
            Self::DiagnosisTimeout,
        ]
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = MendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| MendError::UnknownStopReason {
                name: s.to_string(),
            })
    }
}

/// What choosing an option asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// End the mission here.
    Stop,
    /// Export the repair transcript for manual follow-up.
    Export,
    /// Grant extra budget and resume.
    RetryRepair,
    /// Re-run with a different verification command.
    ChangeCommand,
    /// Approve the pending out-of-scope files and resume.
    ApproveScope,
}

/// One entry of the decision menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    pub action: DecisionAction,
    pub description: String,
}

impl DecisionOption {
    fn new(id: &str, label: &str, action: DecisionAction, description: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            action,
            description: description.into(),
        }
    }
}

/// Details used to fill in option descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub repair_remaining: u32,
    #[serde(default)]
    pub pending_scope_files: Vec<String>,
    #[serde(default)]
    pub failure_type: Option<FailureType>,
    #[serde(default)]
    pub test_command: Option<String>,
}

/// Build the decision menu for a stop reason.
///
/// Every menu ends with `stop` and `export`; reason-specific recovery options
/// come first.
///
/// # Example
///
/// ```
/// use mend::repair::decision::{generate_decision_options, DecisionContext, StopReason};
///
/// let options = generate_decision_options(StopReason::BudgetExhausted, &DecisionContext::default());
/// assert!(options.iter().any(|o| o.id == "retry_repair_one_more"));
/// ```
#[must_use]
pub fn generate_decision_options(
    reason: StopReason,
    context: &DecisionContext,
) -> Vec<DecisionOption> {
    let mut options = Vec::new();

    match reason {
        StopReason::BudgetExhausted => {
            options.push(DecisionOption::new(
                "retry_repair_one_more",
                "Allow one more repair",
                DecisionAction::RetryRepair,
                format!(
                    "Grant one additional repair attempt ({} remaining)",
                    context.repair_remaining
                ),
            ));
        }
        StopReason::ToolingEnvFailure | StopReason::RepeatedFailure => {
            let detail = match (&context.test_command, context.failure_type) {
                (Some(cmd), Some(kind)) => format!("`{cmd}` failed with {kind}"),
                (Some(cmd), None) => format!("`{cmd}` keeps failing"),
                (None, Some(kind)) => format!("verification failed with {kind}"),
                (None, None) => "verification keeps failing".to_string(),
            };
            options.push(DecisionOption::new(
                "change_command",
                "Change verification command",
                DecisionAction::ChangeCommand,
                format!("{detail}; choose a different command and retry"),
            ));
        }
        StopReason::ScopeExpansionDenied if !context.pending_scope_files.is_empty() => {
            options.push(DecisionOption::new(
                "approve_scope",
                "Approve scope expansion",
                DecisionAction::ApproveScope,
                format!(
                    "Allow changes to {} and resume",
                    context.pending_scope_files.join(", ")
                ),
            ));
        }
        _ => {}
    }

    options.push(DecisionOption::new(
        "stop",
        "Stop",
        DecisionAction::Stop,
        reason.description(),
    ));
    options.push(DecisionOption::new(
        "export",
        "Export transcript",
        DecisionAction::Export,
        "Export the failure and repair history for manual follow-up",
    ));

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(options: &[DecisionOption]) -> Vec<&str> {
        options.iter().map(|o| o.id.as_str()).collect()
    }

    #[test]
    fn test_every_reason_has_stop_and_export() {
        for reason in StopReason::all() {
            let options = generate_decision_options(reason, &DecisionContext::default());
            assert!(!options.is_empty());
            assert!(options.iter().any(|o| o.action == DecisionAction::Stop));
            assert!(options.iter().any(|o| o.action == DecisionAction::Export));
        }
    }

    #[test]
    fn test_budget_exhausted_offers_extension() {
        let ctx = DecisionContext {
            repair_remaining: 0,
            ..Default::default()
        };
        let options = generate_decision_options(StopReason::BudgetExhausted, &ctx);
        assert_eq!(ids(&options), vec!["retry_repair_one_more", "stop", "export"]);
        assert_eq!(options[0].action, DecisionAction::RetryRepair);
        assert!(options[0].description.contains("0 remaining"));
    }

    #[test]
    fn test_tooling_and_repeated_offer_change_command() {
        for reason in [StopReason::ToolingEnvFailure, StopReason::RepeatedFailure] {
            let options = generate_decision_options(reason, &DecisionContext::default());
            assert_eq!(ids(&options), vec!["change_command", "stop", "export"]);
        }
    }

    #[test]
    fn test_change_command_mentions_command() {
        let ctx = DecisionContext {
            test_command: Some("npm test".into()),
            failure_type: Some(FailureType::ToolingEnv),
            ..Default::default()
        };
        let options = generate_decision_options(StopReason::ToolingEnvFailure, &ctx);
        assert!(options[0].description.contains("npm test"));
        assert!(options[0].description.contains("TOOLING_ENV"));
    }

    #[test]
    fn test_scope_denied_with_pending_files_offers_approve() {
        let ctx = DecisionContext {
            pending_scope_files: vec!["src/other.ts".into()],
            ..Default::default()
        };
        let options = generate_decision_options(StopReason::ScopeExpansionDenied, &ctx);
        assert_eq!(ids(&options), vec!["approve_scope", "stop", "export"]);
        assert!(options[0].description.contains("src/other.ts"));
    }

    #[test]
    fn test_scope_denied_without_pending_files() {
        let options =
            generate_decision_options(StopReason::ScopeExpansionDenied, &DecisionContext::default());
        assert_eq!(ids(&options), vec!["stop", "export"]);
    }

    #[test]
    fn test_plain_reasons_only_stop_and_export() {
        for reason in [
            StopReason::EmptyDiffExhausted,
            StopReason::DiagnosisTimeout,
            StopReason::MissionCancelled,
        ] {
            let options = generate_decision_options(reason, &DecisionContext::default());
            assert_eq!(ids(&options), vec!["stop", "export"]);
        }
    }

    #[test]
    fn test_menu_is_deterministic() {
        let ctx = DecisionContext {
            repair_remaining: 1,
            ..Default::default()
        };
        assert_eq!(
            generate_decision_options(StopReason::BudgetExhausted, &ctx),
            generate_decision_options(StopReason::BudgetExhausted, &ctx)
        );
    }

    #[test]
    fn test_stop_reason_parse() {
        assert_eq!(
            "budget_exhausted".parse::<StopReason>().unwrap(),
            StopReason::BudgetExhausted
        );
        assert!("nope".parse::<StopReason>().is_err());
        for reason in StopReason::all() {
            assert_eq!(reason.as_str().parse::<StopReason>().unwrap(), reason);
        }
    }

    #[test]
    fn test_stop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&StopReason::EmptyDiffExhausted).unwrap();
        assert_eq!(json, "\"empty_diff_exhausted\"");
    }
}
