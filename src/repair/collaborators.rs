//! Collaborator contracts consumed by the repair runner.
//!
//! The runner never runs tests, produces diffs, or touches the filesystem
//! itself. Those capabilities are injected at construction as trait objects
//! bundled in [`RepairCapabilities`]. Any `Err` returned by a collaborator is
//! treated as a tooling/environment failure.

use crate::repair::classifier::FailureClassification;
use crate::repair::state::RunnerStage;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Output of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailureInput {
    pub raw_output: String,
    pub command: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl TestFailureInput {
    /// Capture a run finished just now.
    pub fn new(command: impl Into<String>, exit_code: i32, raw_output: impl Into<String>) -> Self {
        Self {
            raw_output: raw_output.into(),
            command: command.into(),
            exit_code,
            timestamp: Utc::now(),
        }
    }

    /// Whether verification passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Diagnosis of a failure, fed into diff generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub root_cause: String,
    #[serde(default)]
    pub suggested_files: Vec<String>,
}

/// One applied repair, kept as history for later attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairAttempt {
    pub iteration: u32,
    pub diff_id: String,
    pub summary: String,
    pub files_affected: Vec<String>,
    pub failure_signature: String,
}

/// Everything a generator gets to work with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairContext {
    pub task_id: String,
    pub failure: FailureClassification,
    pub raw_output: String,
    pub test_command: String,
    pub allowed_files: Vec<String>,
    pub history: Vec<RepairAttempt>,
    #[serde(default)]
    pub diagnosis: Option<Diagnosis>,
}

/// A proposed repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairDiffProposal {
    pub diff_id: String,
    pub unified_diff: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl RepairDiffProposal {
    /// An empty diff counts toward the empty-diff limit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unified_diff.trim().is_empty()
    }

    /// Declared files merged with every path the diff itself names.
    ///
    /// Scope checks use this rather than `files_affected` alone, so a
    /// generator that under-reports cannot slip a file past approval.
    #[must_use]
    pub fn touched_files(&self) -> Vec<String> {
        let mut files = self.files_affected.clone();
        for file in files_in_diff(&self.unified_diff) {
            if !files.contains(&file) {
                files.push(file);
            }
        }
        files
    }
}

/// Runs the verification step.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run verification once and report its output.
    ///
    /// # Errors
    ///
    /// Returns an error only when the command could not be run at all; a
    /// failing test is a successful call with a non-zero exit code.
    async fn run_test(&self) -> Result<TestFailureInput>;
}

/// Produces diagnoses and repair diffs.
#[async_trait]
pub trait RepairDiffGenerator: Send + Sync {
    /// Diagnose the failure in `context`.
    ///
    /// The default derives a diagnosis from the classification alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing service fails.
    async fn diagnose(&self, context: &RepairContext) -> Result<Diagnosis> {
        Ok(Diagnosis {
            root_cause: format!("{}: {}", context.failure.failure_type, context.failure.summary),
            suggested_files: context.failure.file_references.clone(),
        })
    }

    /// Propose a diff for the failure in `context`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing service fails.
    async fn generate_diff(&self, context: &RepairContext) -> Result<RepairDiffProposal>;
}

/// Applies a proposal to the workspace.
#[async_trait]
pub trait DiffApplicator: Send + Sync {
    /// Apply the proposal. `Ok(true)` iff it applied cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the applicator itself is broken.
    async fn apply_diff(&self, proposal: &RepairDiffProposal) -> Result<bool>;
}

/// Kind of human approval requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// A diff touches files outside the allowed set.
    ScopeExpansion,
    /// Re-run verification after a diff was applied.
    TestRerun,
}

/// An approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub task_id: String,
    pub mode: String,
    pub stage: RunnerStage,
    pub approval_type: ApprovalType,
    pub description: String,
    pub context: serde_json::Value,
}

/// Human decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// Presents approval requests to a human.
#[async_trait]
pub trait ApprovalManager: Send + Sync {
    /// Ask for a decision. May wait indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be presented.
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalDecision>;
}

/// The capability set the runner is constructed with.
#[derive(Clone)]
pub struct RepairCapabilities {
    pub test_runner: Arc<dyn TestRunner>,
    pub diff_generator: Arc<dyn RepairDiffGenerator>,
    pub diff_applicator: Arc<dyn DiffApplicator>,
}

impl RepairCapabilities {
    pub fn new(
        test_runner: Arc<dyn TestRunner>,
        diff_generator: Arc<dyn RepairDiffGenerator>,
        diff_applicator: Arc<dyn DiffApplicator>,
    ) -> Self {
        Self {
            test_runner,
            diff_generator,
            diff_applicator,
        }
    }
}

impl std::fmt::Debug for RepairCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairCapabilities").finish_non_exhaustive()
    }
}

/// Paths named by the file headers of a unified diff.
///
/// Covers both sides of each `---`/`+++` pair, so deletions (`+++ /dev/null`)
/// and creations (`--- /dev/null`) are reported, as are git `rename`/`copy`
/// headers.
#[must_use]
pub fn files_in_diff(diff: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |path: &str, prefix: &str| {
        let path = path.split('\t').next().unwrap_or(path).trim();
        if path.is_empty() || path == "/dev/null" {
            return;
        }
        let path = path.strip_prefix(prefix).unwrap_or(path).to_string();
        if !files.contains(&path) {
            files.push(path);
        }
    };

    let mut lines = diff.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(old) = line.strip_prefix("--- ") {
            let Some(new) = lines.peek().and_then(|next| next.strip_prefix("+++ ")) else {
                continue;
            };
            push(old, "a/");
            push(new, "b/");
            lines.next();
        } else if let Some(path) = line
            .strip_prefix("rename from ")
            .or_else(|| line.strip_prefix("rename to "))
            .or_else(|| line.strip_prefix("copy from "))
            .or_else(|| line.strip_prefix("copy to "))
        {
            push(path, "");
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::classifier::classify_failure;

    struct OnlyDiff;

    #[async_trait]
    impl RepairDiffGenerator for OnlyDiff {
        async fn generate_diff(&self, _context: &RepairContext) -> Result<RepairDiffProposal> {
            Ok(RepairDiffProposal {
                diff_id: "d".into(),
                unified_diff: String::new(),
                files_affected: Vec::new(),
                summary: String::new(),
            })
        }
    }

    fn context() -> RepairContext {
        RepairContext {
            task_id: "t".into(),
            failure: classify_failure("FAIL src/a.test.ts expected 1 to be 2"),
            raw_output: String::new(),
            test_command: "npm test".into(),
            allowed_files: vec![],
            history: vec![],
            diagnosis: None,
        }
    }

    #[test]
    fn test_passed_is_exit_code_zero() {
        assert!(TestFailureInput::new("x", 0, "").passed());
        assert!(!TestFailureInput::new("x", 1, "").passed());
    }

    #[test]
    fn test_proposal_empty_ignores_whitespace() {
        let p = RepairDiffProposal {
            diff_id: "d".into(),
            unified_diff: "  \n".into(),
            files_affected: vec![],
            summary: String::new(),
        };
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_default_diagnosis_uses_classification() {
        let diagnosis = OnlyDiff.diagnose(&context()).await.unwrap();
        assert!(diagnosis.root_cause.starts_with("TEST_ASSERTION"));
        assert_eq!(diagnosis.suggested_files, vec!["src/a.test.ts".to_string()]);
    }

    #[test]
    fn test_proposal_deserializes_with_missing_optional_fields() {
        let p: RepairDiffProposal =
            serde_json::from_str(r#"{"diffId":"x","unifiedDiff":"--- a\n+++ b\n"}"#).unwrap();
        assert_eq!(p.diff_id, "x");
        assert!(p.files_affected.is_empty());
        assert!(!p.is_empty());
    }

    #[test]
    fn test_files_in_diff_reports_both_sides() {
        let diff = "--- a/x.rs\n+++ b/x.rs\n@@ -1 +1 @@\n-a\n+b\n\
                    --- a/y.rs\n+++ b/y.rs\t2024-01-01\n\
                    --- a/secrets/config.rs\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n\
                    --- /dev/null\n+++ b/new.rs\n@@ -0,0 +1 @@\n+y\n";
        assert_eq!(
            files_in_diff(diff),
            vec!["x.rs", "y.rs", "secrets/config.rs", "new.rs"]
        );
    }

    #[test]
    fn test_files_in_diff_ignores_hunk_lines_that_look_like_headers() {
        // A removed SQL comment renders as `--- ..` without a `+++` partner.
        let diff = "--- a/q.sql\n+++ b/q.sql\n@@ -1,2 +1 @@\n--- old note\n select 1;\n";
        assert_eq!(files_in_diff(diff), vec!["q.sql"]);
    }

    #[test]
    fn test_files_in_diff_renames() {
        let diff = "diff --git a/old.rs b/new.rs\nsimilarity index 100%\nrename from old.rs\nrename to new.rs\n";
        assert_eq!(files_in_diff(diff), vec!["old.rs", "new.rs"]);
    }

    #[test]
    fn test_touched_files_merges_declared_and_parsed() {
        let p = RepairDiffProposal {
            diff_id: "d".into(),
            unified_diff: "--- a/src/a.rs\n+++ b/src/a.rs\n--- a/Cargo.toml\n+++ /dev/null\n".into(),
            files_affected: vec!["src/a.rs".into()],
            summary: String::new(),
        };
        assert_eq!(p.touched_files(), vec!["src/a.rs", "Cargo.toml"]);
    }
}
