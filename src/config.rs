//! Configuration management for mend.
//!
//! Two layers: [`RepairPolicy`] holds the knobs of the self-correction loop,
//! [`MendConfig`] wraps it together with project-level settings loaded from
//! `.mend/config.toml`. Missing files and missing keys fall back to defaults.

use crate::error::{MendError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config directory name inside a project
pub const CONFIG_DIR: &str = ".mend";

/// Config file name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.toml";

// ============================================================================
// Repair Policy
// ============================================================================

/// Policy governing the bounded self-correction loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairPolicy {
    /// Repair budget: number of diffs that may be applied.
    #[serde(default = "default_max_repair_iterations")]
    pub max_repair_iterations: u32,

    /// Identical consecutive failures tolerated before stopping.
    #[serde(default = "default_max_consecutive_same_failure")]
    pub max_consecutive_same_failure: u32,

    /// Re-run verification after an applied diff without asking.
    #[serde(default = "default_true")]
    pub allow_auto_rerun_allowlisted_tests: bool,

    /// Stop when the human denies a scope expansion.
    #[serde(default = "default_true")]
    pub stop_on_scope_expansion_denied: bool,

    /// Count diffs that no longer apply cleanly toward the empty-diff limit.
    #[serde(default = "default_true")]
    pub stop_on_repeated_stale_context: bool,

    /// Give diagnosis and diff generation one free retry after a timeout.
    #[serde(default = "default_true")]
    pub timeout_retry_once: bool,

    /// Diagnosis stage timeout in milliseconds.
    #[serde(default = "default_diagnosis_timeout_ms")]
    pub repair_diagnosis_timeout_ms: u64,

    /// Diff generation stage timeout in milliseconds.
    #[serde(default = "default_diff_gen_timeout_ms")]
    pub repair_diff_gen_timeout_ms: u64,
}

fn default_max_repair_iterations() -> u32 {
    3
}

fn default_max_consecutive_same_failure() -> u32 {
    2
}

fn default_diagnosis_timeout_ms() -> u64 {
    60_000
}

fn default_diff_gen_timeout_ms() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            max_repair_iterations: default_max_repair_iterations(),
            max_consecutive_same_failure: default_max_consecutive_same_failure(),
            allow_auto_rerun_allowlisted_tests: true,
            stop_on_scope_expansion_denied: true,
            stop_on_repeated_stale_context: true,
            timeout_retry_once: true,
            repair_diagnosis_timeout_ms: default_diagnosis_timeout_ms(),
            repair_diff_gen_timeout_ms: default_diff_gen_timeout_ms(),
        }
    }
}

impl RepairPolicy {
    /// Diagnosis timeout as a [`Duration`].
    #[must_use]
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_diagnosis_timeout_ms)
    }

    /// Diff generation timeout as a [`Duration`].
    #[must_use]
    pub fn diff_gen_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_diff_gen_timeout_ms)
    }

    /// Reject values that would make the loop meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`MendError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_repair_iterations == 0 {
            return Err(MendError::invalid_config(
                "maxRepairIterations",
                "must be at least 1",
            ));
        }
        if self.max_consecutive_same_failure == 0 {
            return Err(MendError::invalid_config(
                "maxConsecutiveSameFailure",
                "must be at least 1",
            ));
        }
        if self.repair_diagnosis_timeout_ms == 0 {
            return Err(MendError::invalid_config(
                "repairDiagnosisTimeoutMs",
                "must be greater than 0",
            ));
        }
        if self.repair_diff_gen_timeout_ms == 0 {
            return Err(MendError::invalid_config(
                "repairDiffGenTimeoutMs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Project Config
// ============================================================================

/// Project-level configuration read from `.mend/config.toml`.
///
/// # Example
///
/// ```toml
/// testCommand = "npm test"
/// generatorCommand = "./scripts/propose-fix.sh"
/// allowedFiles = ["src/**/*.ts"]
///
/// [policy]
/// maxRepairIterations = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MendConfig {
    #[serde(default)]
    pub policy: RepairPolicy,

    /// Verification command (test, typecheck, lint, or build).
    #[serde(default)]
    pub test_command: Option<String>,

    /// Command that turns a repair context (JSON on stdin) into a proposal.
    #[serde(default)]
    pub generator_command: Option<String>,

    /// Paths or globs the repair may touch without asking.
    #[serde(default)]
    pub allowed_files: Vec<String>,

    /// Append repair events as JSON lines to this file.
    #[serde(default)]
    pub events_log: Option<PathBuf>,
}

impl MendConfig {
    /// Load configuration for a project, defaulting when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// fails policy validation.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: MendConfig = toml::from_str(&content)
            .map_err(|e| MendError::config_with_path(e.to_string(), path.clone()))?;
        config.policy.validate()?;
        Ok(config)
    }

    /// Path of the config file for a project.
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_policy_defaults() {
        let policy = RepairPolicy::default();
        assert_eq!(policy.max_repair_iterations, 3);
        assert_eq!(policy.max_consecutive_same_failure, 2);
        assert!(policy.timeout_retry_once);
        assert!(policy.stop_on_scope_expansion_denied);
        assert_eq!(policy.diagnosis_timeout(), Duration::from_secs(60));
        assert_eq!(policy.diff_gen_timeout(), Duration::from_secs(120));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_validation_rejects_zero_budget() {
        let policy = RepairPolicy {
            max_repair_iterations: 0,
            ..Default::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("maxRepairIterations"));
    }

    #[test]
    fn test_policy_validation_rejects_zero_timeout() {
        let policy = RepairPolicy {
            repair_diff_gen_timeout_ms: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_partial_json_uses_defaults() {
        let policy: RepairPolicy =
            serde_json::from_str(r#"{"maxRepairIterations": 7, "timeoutRetryOnce": false}"#)
                .unwrap();
        assert_eq!(policy.max_repair_iterations, 7);
        assert!(!policy.timeout_retry_once);
        assert_eq!(policy.max_consecutive_same_failure, 2);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = MendConfig::load(temp.path()).unwrap();
        assert_eq!(config, MendConfig::default());
    }

    #[test]
    fn test_load_toml_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            MendConfig::config_path(temp.path()),
            r#"
testCommand = "npm test"
allowedFiles = ["src/**/*.ts", "package.json"]

[policy]
maxRepairIterations = 5
"#,
        )
        .unwrap();

        let config = MendConfig::load(temp.path()).unwrap();
        assert_eq!(config.test_command.as_deref(), Some("npm test"));
        assert_eq!(config.allowed_files.len(), 2);
        assert_eq!(config.policy.max_repair_iterations, 5);
        assert_eq!(config.policy.max_consecutive_same_failure, 2);
    }

    #[test]
    fn test_load_invalid_policy_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            MendConfig::config_path(temp.path()),
            "[policy]\nmaxConsecutiveSameFailure = 0\n",
        )
        .unwrap();

        let err = MendConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, MendError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_malformed_toml_reports_path() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(MendConfig::config_path(temp.path()), "testCommand = [").unwrap();

        let err = MendConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, MendError::Config { path: Some(_), .. }));
    }
}
