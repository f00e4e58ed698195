//! Real collaborator implementations.
//!
//! These back the repair runner with actual processes: a shell test command,
//! an external diff generator speaking JSON over stdio, `git apply`, and a
//! terminal prompt for approvals. They implement the same traits as the mocks
//! in [`crate::testing`].

use crate::error::{MendError, Result as MendResult};
use crate::repair::collaborators::{
    ApprovalDecision, ApprovalManager, ApprovalRequest, Diagnosis, DiffApplicator,
    RepairContext, RepairDiffGenerator, RepairDiffProposal, TestFailureInput, TestRunner,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command as AsyncCommand};
use tracing::debug;

/// Exit code reported for a test command that ran past its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

fn shell(command: &str, project_dir: &Path) -> AsyncCommand {
    let mut cmd = AsyncCommand::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(project_dir)
        .kill_on_drop(true);
    cmd
}

/// Write `payload` to the child's stdin and close it.
///
/// A child may exit without reading all of its input. The broken pipe is
/// ignored and the exit status decides the result.
async fn feed_stdin(child: &mut Child, payload: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    let written = match stdin.write_all(payload).await {
        Ok(()) => stdin.flush().await,
        Err(e) => Err(e),
    };
    match written {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Child closed stdin after {} byte payload", payload.len());
            Ok(())
        }
        other => other,
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

// ============================================================================
// Test runner
// ============================================================================

/// Runs the verification command through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
    project_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandTestRunner {
    #[must_use]
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
            timeout: None,
        }
    }

    /// Kill the command after `timeout` and report it as timed out.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_test(&self) -> Result<TestFailureInput> {
        debug!("Running verification: {}", self.command);
        let mut cmd = shell(&self.command, &self.project_dir);
        cmd.stdin(Stdio::null());
        let run = cmd.output();

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(output) => output,
                Err(_) => {
                    return Ok(TestFailureInput::new(
                        self.command.as_str(),
                        TIMEOUT_EXIT_CODE,
                        format!(
                            "Test command timed out after {}ms: {}",
                            timeout.as_millis(),
                            self.command
                        ),
                    ))
                }
            },
            None => run.await,
        }
        .with_context(|| format!("Failed to run test command: {}", self.command))?;

        Ok(TestFailureInput::new(
            self.command.as_str(),
            output.status.code().unwrap_or(1),
            combined_output(&output),
        ))
    }
}

// ============================================================================
// Diff generator
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratorRequest<'a> {
    stage: &'a str,
    context: &'a RepairContext,
}

/// Delegates diagnosis and diff generation to an external command.
///
/// The command receives `{"stage": "diagnose" | "generate", "context": {..}}`
/// on stdin and answers with a JSON [`Diagnosis`] or [`RepairDiffProposal`]
/// on stdout. Empty stdout means "no opinion" for a diagnosis and an empty
/// diff for generation. The process is killed if the runner times it out.
#[derive(Debug, Clone)]
pub struct CommandDiffGenerator {
    command: String,
    project_dir: PathBuf,
}

impl CommandDiffGenerator {
    #[must_use]
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
        }
    }

    async fn invoke(&self, stage: &str, context: &RepairContext) -> Result<String> {
        let payload = serde_json::to_vec(&GeneratorRequest { stage, context })?;

        let mut child = shell(&self.command, &self.project_dir)
            .env("MEND_STAGE", stage)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start generator: {}", self.command))?;

        feed_stdin(&mut child, &payload).await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Generator failed during {}: {}", stage, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RepairDiffGenerator for CommandDiffGenerator {
    async fn diagnose(&self, context: &RepairContext) -> Result<Diagnosis> {
        let stdout = self.invoke("diagnose", context).await?;
        if stdout.is_empty() {
            return Ok(Diagnosis {
                root_cause: format!("{}: {}", context.failure.failure_type, context.failure.summary),
                suggested_files: context.failure.file_references.clone(),
            });
        }
        serde_json::from_str(&stdout).context("Generator returned an invalid diagnosis")
    }

    async fn generate_diff(&self, context: &RepairContext) -> Result<RepairDiffProposal> {
        let stdout = self.invoke("generate", context).await?;
        let mut proposal = if stdout.is_empty() {
            RepairDiffProposal {
                diff_id: String::new(),
                unified_diff: String::new(),
                files_affected: Vec::new(),
                summary: String::new(),
            }
        } else {
            serde_json::from_str::<RepairDiffProposal>(&stdout)
                .context("Generator returned an invalid diff proposal")?
        };

        if proposal.diff_id.trim().is_empty() {
            proposal.diff_id = uuid::Uuid::new_v4().to_string();
        }
        proposal.files_affected = proposal.touched_files();
        Ok(proposal)
    }
}

// ============================================================================
// Diff applicator
// ============================================================================

/// Applies unified diffs with `git apply`.
#[derive(Debug, Clone)]
pub struct GitApplyApplicator {
    project_dir: PathBuf,
}

impl GitApplyApplicator {
    /// # Errors
    ///
    /// Returns [`MendError::MissingTool`] if `git` is not on `PATH`.
    pub fn new(project_dir: impl Into<PathBuf>) -> MendResult<Self> {
        which::which("git").map_err(|_| MendError::MissingTool {
            tool: "git".to_string(),
        })?;
        Ok(Self {
            project_dir: project_dir.into(),
        })
    }

    async fn git_apply(&self, args: &[&str], diff: &str) -> Result<bool> {
        let mut child = AsyncCommand::new("git")
            .arg("apply")
            .args(args)
            .arg("-")
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to run git apply")?;

        feed_stdin(&mut child, diff.as_bytes()).await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            debug!(
                "git apply {:?} rejected diff: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

#[async_trait]
impl DiffApplicator for GitApplyApplicator {
    async fn apply_diff(&self, proposal: &RepairDiffProposal) -> Result<bool> {
        if !self.git_apply(&["--check"], &proposal.unified_diff).await? {
            return Ok(false);
        }
        self.git_apply(&[], &proposal.unified_diff).await
    }
}

// ============================================================================
// Approvals
// ============================================================================

/// How a [`TerminalApprovalManager`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Ask on the terminal.
    Prompt,
    /// Approve everything.
    AutoApprove,
    /// Deny everything.
    AutoDeny,
}

/// Asks for approval on stdin/stderr.
#[derive(Debug, Clone)]
pub struct TerminalApprovalManager {
    mode: ApprovalMode,
}

impl TerminalApprovalManager {
    #[must_use]
    pub fn new(mode: ApprovalMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }
}

#[async_trait]
impl ApprovalManager for TerminalApprovalManager {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalDecision> {
        match self.mode {
            ApprovalMode::AutoApprove => return Ok(ApprovalDecision::Approved),
            ApprovalMode::AutoDeny => return Ok(ApprovalDecision::Denied),
            ApprovalMode::Prompt => {}
        }

        eprintln!(
            "\n{} {}",
            "Approval needed:".yellow().bold(),
            request.description
        );
        eprint!("Approve? [y/N] ");

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .context("Approval prompt panicked")?
        .context("Failed to read approval answer")?;

        let approved = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");
        Ok(if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::classifier::classify_failure;
    use crate::repair::state::RunnerStage;
    use crate::repair::collaborators::ApprovalType;
    use tempfile::TempDir;

    fn context() -> RepairContext {
        RepairContext {
            task_id: "t".into(),
            failure: classify_failure("FAIL src/a.ts expected 1 to be 2"),
            raw_output: "FAIL".into(),
            test_command: "true".into(),
            allowed_files: vec!["src/a.ts".into()],
            history: vec![],
            diagnosis: None,
        }
    }

    #[tokio::test]
    async fn test_command_runner_captures_exit_code_and_output() {
        let temp = TempDir::new().unwrap();
        let runner = CommandTestRunner::new("echo out; echo err >&2; exit 3", temp.path());
        let result = runner.run_test().await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.raw_output.contains("out"));
        assert!(result.raw_output.contains("err"));
        assert_eq!(result.command, "echo out; echo err >&2; exit 3");
    }

    #[tokio::test]
    async fn test_command_runner_timeout_reports_timed_out() {
        let temp = TempDir::new().unwrap();
        let runner =
            CommandTestRunner::new("sleep 5", temp.path()).with_timeout(Duration::from_millis(50));
        let result = runner.run_test().await.unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.raw_output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_generator_parses_proposal_and_fills_gaps() {
        let temp = TempDir::new().unwrap();
        let script = r#"cat > /dev/null; printf '%s' '{"unifiedDiff":"--- a/src/a.ts\n+++ b/src/a.ts\n@@ -1 +1 @@\n-a\n+b\n"}'"#;
        let gen = CommandDiffGenerator::new(script, temp.path());
        let proposal = gen.generate_diff(&context()).await.unwrap();
        assert!(!proposal.is_empty());
        assert!(!proposal.diff_id.is_empty());
        assert_eq!(proposal.files_affected, vec!["src/a.ts".to_string()]);
    }

    #[tokio::test]
    async fn test_generator_empty_stdout() {
        let temp = TempDir::new().unwrap();
        let gen = CommandDiffGenerator::new("cat > /dev/null", temp.path());
        assert!(gen.generate_diff(&context()).await.unwrap().is_empty());
        let diagnosis = gen.diagnose(&context()).await.unwrap();
        assert!(diagnosis.root_cause.starts_with("TEST_ASSERTION"));
    }

    #[tokio::test]
    async fn test_generator_that_ignores_stdin() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context();
        ctx.raw_output = "FAIL expected 1 to be 2\n".repeat(50_000);
        let gen = CommandDiffGenerator::new("exit 0", temp.path());
        assert!(gen.generate_diff(&ctx).await.unwrap().is_empty());

        let gen = CommandDiffGenerator::new("echo unavailable >&2; exit 3", temp.path());
        let err = gen.generate_diff(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_generator_failure_is_error() {
        let temp = TempDir::new().unwrap();
        let gen = CommandDiffGenerator::new("cat > /dev/null; echo boom >&2; exit 2", temp.path());
        let err = gen.generate_diff(&context()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_generator_reports_files_missing_from_declaration() {
        let temp = TempDir::new().unwrap();
        let script = r#"cat > /dev/null; printf '%s' '{"unifiedDiff":"--- a/src/a.ts\n+++ b/src/a.ts\n@@ -1 +1 @@\n-a\n+b\n--- a/secrets/config.rs\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n","filesAffected":["src/a.ts"]}'"#;
        let gen = CommandDiffGenerator::new(script, temp.path());
        let proposal = gen.generate_diff(&context()).await.unwrap();
        assert_eq!(
            proposal.files_affected,
            vec!["src/a.ts".to_string(), "secrets/config.rs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_auto_approval_modes() {
        let request = ApprovalRequest {
            task_id: "t".into(),
            mode: "repair".into(),
            stage: RunnerStage::AwaitingScopeApproval,
            approval_type: ApprovalType::ScopeExpansion,
            description: "x".into(),
            context: serde_json::Value::Null,
        };
        let yes = TerminalApprovalManager::new(ApprovalMode::AutoApprove);
        let no = TerminalApprovalManager::new(ApprovalMode::AutoDeny);
        assert_eq!(
            yes.request_approval(request.clone()).await.unwrap(),
            ApprovalDecision::Approved
        );
        assert_eq!(no.request_approval(request).await.unwrap(), ApprovalDecision::Denied);
    }
}
