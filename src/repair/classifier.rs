//! Failure classification for verification output.
//!
//! Turns arbitrary tool output (test runners, type checkers, linters,
//! compilers) into a typed [`FailureClassification`] with a noise-resistant
//! signature used for repeat detection.
//!
//! # Architecture
//!
//! ```text
//! raw output ──normalize──> normalized text ──sha256──> failure signature
//!      │
//!      └──detectors (fixed priority)──> FailureType + summary
//!      └──path patterns──> file references
//! ```
//!
//! # Example
//!
//! ```
//! use mend::repair::classifier::{classify_failure, FailureType};
//!
//! let c = classify_failure("FAIL src/math.test.ts\n  expected 1 to be 2");
//! assert_eq!(c.failure_type, FailureType::TestAssertion);
//! assert!(c.is_code_fixable);
//! assert_eq!(c.file_references, vec!["src/math.test.ts".to_string()]);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Number of hex characters kept from the SHA-256 digest.
pub const SIGNATURE_LENGTH: usize = 16;

/// Maximum length of a classification summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 200;

/// Placeholder tokens substituted by [`normalize_output`].
pub mod placeholders {
    pub const TIMESTAMP: &str = "[TIMESTAMP]";
    pub const HOME: &str = "[HOME]";
    pub const UUID: &str = "[UUID]";
    pub const ADDR: &str = "[ADDR]";
    pub const DURATION: &str = "[DURATION]";
}

// ============================================================================
// Failure Types
// ============================================================================

/// Kind of verification failure.
///
/// Variants are listed in detector priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Assertion or expectation mismatch in a test
    TestAssertion,
    /// Static type error
    Typecheck,
    /// Linter diagnostic
    Lint,
    /// Compiler or bundler failure
    BuildCompile,
    /// Missing module, package manager error, broken toolchain
    ToolingEnv,
    /// Execution timed out
    Timeout,
    /// Nothing matched confidently
    Unknown,
}

impl FailureType {
    /// Canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestAssertion => "TEST_ASSERTION",
            Self::Typecheck => "TYPECHECK",
            Self::Lint => "LINT",
            Self::BuildCompile => "BUILD_COMPILE",
            Self::ToolingEnv => "TOOLING_ENV",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether an edit to the code can plausibly make this failure go away.
    #[must_use]
    pub fn is_code_fixable(&self) -> bool {
        matches!(
            self,
            Self::TestAssertion | Self::Typecheck | Self::Lint | Self::BuildCompile
        )
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureClassification {
    /// Detected failure kind.
    pub failure_type: FailureType,
    /// Whether the loop may attempt a code repair.
    pub is_code_fixable: bool,
    /// Stable hash of the normalized output.
    pub failure_signature: String,
    /// One-line human summary.
    pub summary: String,
    /// Source files mentioned in the output, first-seen order.
    pub file_references: Vec<String>,
}

impl FailureClassification {
    /// Synthetic classification for a collaborator that failed outright.
    ///
    /// Used when the test runner, generator, or applicator returns an error:
    /// the failure is treated as environmental and never code-fixable.
    #[must_use]
    pub fn tooling_env(message: &str) -> Self {
        let raw = format!("collaborator failure: {message}");
        Self {
            failure_type: FailureType::ToolingEnv,
            is_code_fixable: false,
            failure_signature: compute_signature(&normalize_output(&raw)),
            summary: truncate_summary(&raw),
            file_references: Vec::new(),
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

struct Normalizer {
    rules: Vec<(Regex, &'static str)>,
}

impl Normalizer {
    fn new() -> Self {
        // Order matters: UUIDs and timestamps must be replaced before the
        // duration rule can see their digit runs.
        let rules = vec![
            (r"\x1b\[[0-9;]*[A-Za-z]", ""),
            (
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
                placeholders::UUID,
            ),
            (
                r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
                placeholders::TIMESTAMP,
            ),
            (
                r"\b\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\b",
                placeholders::TIMESTAMP,
            ),
            (r"\b0x[0-9a-fA-F]{4,}\b", placeholders::ADDR),
            (r"(?:/home|/Users)/[^/\s:]+", placeholders::HOME),
            (r"(?i)\b[A-Z]:\\Users\\[^\\\s:]+", placeholders::HOME),
            // Any other absolute prefix in front of a project-relative tail,
            // e.g. `/tmp/build-1a2b/src/..` or `/github/workspace/tests/..`.
            (
                r"(?m)(^|[\s(\[=,'\x22])(?:/[^/\s:'\x22()\[\]]+)+?/((?:src|lib|tests?|__tests__|spec|app|apps|packages|crates|pkg|cmd|internal|benches|node_modules)/)",
                "${1}[HOME]/${2}",
            ),
            (
                r"(?m)(^|[\s(\[=,'\x22])(?:/private)?(?:/tmp|/var/folders/[^/\s]+/[^/\s]+/T)/[^/\s:'\x22()\[\]]+",
                "${1}[HOME]",
            ),
            (
                r"\b\d+(?:\.\d+)?\s?(?:ns|µs|us|ms|s|secs?|seconds?|mins?|minutes?)\b",
                placeholders::DURATION,
            ),
        ];

        Self {
            rules: rules
                .into_iter()
                .filter_map(|(pattern, token)| Regex::new(pattern).ok().map(|re| (re, token)))
                .collect(),
        }
    }

    fn apply(&self, raw: &str) -> String {
        let mut text = raw.to_string();
        for (re, token) in &self.rules {
            text = re.replace_all(&text, *token).into_owned();
        }
        text
    }
}

fn normalizer() -> &'static Normalizer {
    static NORMALIZER: OnceLock<Normalizer> = OnceLock::new();
    NORMALIZER.get_or_init(Normalizer::new)
}

/// Replace non-semantic noise with fixed placeholder tokens.
///
/// Timestamps, absolute path prefixes, UUIDs, memory addresses, and elapsed
/// durations are substituted so that two runs of the same failure normalize
/// identically. ANSI colour escapes are dropped.
///
/// ```
/// use mend::repair::classifier::normalize_output;
///
/// let a = normalize_output("2024-01-02T10:11:12Z run 550e8400-e29b-41d4-a716-446655440000 took 12ms");
/// assert_eq!(a, "[TIMESTAMP] run [UUID] took [DURATION]");
/// ```
#[must_use]
pub fn normalize_output(raw: &str) -> String {
    normalizer().apply(raw)
}

/// Stable signature of already-normalized text.
#[must_use]
pub fn compute_signature(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(SIGNATURE_LENGTH);
    hex
}

fn truncate_summary(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= MAX_SUMMARY_CHARS {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(MAX_SUMMARY_CHARS - 3).collect();
        s.push_str("...");
        s
    }
}

// ============================================================================
// Failure Classifier
// ============================================================================

/// Classifies verification output using prioritized detectors.
pub struct FailureClassifier {
    /// Detector patterns grouped by failure type, in priority order.
    detectors: Vec<(FailureType, Vec<Regex>)>,
    /// Path-like pattern for file reference extraction.
    file_pattern: Option<Regex>,
}

impl FailureClassifier {
    /// Create a classifier with the default detector set.
    #[must_use]
    pub fn new() -> Self {
        let detectors: Vec<(FailureType, Vec<&str>)> = vec![
            (
                FailureType::TestAssertion,
                vec![
                    r"(?i)assertion ?(?:error|failed)",
                    r"(?i)\bexpect(?:ed)?\b.*\bto (?:be|equal|have|contain|match|throw)",
                    r"\bFAIL(?:ED)?\b",
                    r"panicked at",
                    r"(?m)^\s*left: .+$",
                    r"(?m)^\s*Expected:.*$",
                    r"(?m)^E\s+assert ",
                ],
            ),
            (
                FailureType::Typecheck,
                vec![
                    r"error TS\d+",
                    r"is not assignable to (?:type|parameter)",
                    r"Property '.+' does not exist on type",
                    r"mismatched types",
                    r"(?i)\btype ?error\b",
                    r"Incompatible (?:types|return value type)",
                    r"(?i)type annotations needed",
                ],
            ),
            (
                FailureType::Lint,
                vec![
                    r"\beslint\b",
                    r"clippy::",
                    r"(?m)^\s*\d+:\d+\s+(?:error|warning)\s+.+\s+[@\w/-]+$",
                    r"(?i)\blint(?:ing)? (?:error|failed|warning)",
                    r"(?i)\b(?:ruff|flake8|pylint|golangci-lint|rubocop)\b",
                    r"(?i)\bprettier\b",
                ],
            ),
            (
                FailureType::BuildCompile,
                vec![
                    r"error\[E\d+\]",
                    r"could not compile",
                    r"(?i)compil(?:ation|e|er) (?:error|failed)",
                    r"(?i)failed to compile",
                    r"(?i)build failed",
                    r"Module build failed",
                    r"\bSyntaxError\b",
                    r"undefined reference to",
                ],
            ),
            (
                FailureType::ToolingEnv,
                vec![
                    r"Cannot find module",
                    r"ModuleNotFoundError",
                    r"No module named",
                    r"(?i)command not found",
                    r"npm ERR!",
                    r"ERR_PNPM",
                    r"(?i)\byarn (?:error|ERR)",
                    r"\bENOENT\b",
                    r"\bEACCES\b",
                    r"(?i)permission denied",
                    r"error: no such command",
                    r"could not find `Cargo.toml`",
                    r"(?i)failed to (?:download|fetch|resolve|install)",
                ],
            ),
            (
                FailureType::Timeout,
                vec![r"(?i)timed out", r"(?i)\btimeout\b", r"\bETIMEDOUT\b"],
            ),
        ];

        let detectors = detectors
            .into_iter()
            .map(|(kind, patterns)| {
                let compiled = patterns
                    .into_iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect();
                (kind, compiled)
            })
            .collect();

        let file_pattern = Regex::new(
            r#"(?:^|[\s(\[<'"`=])((?:[A-Za-z]:)?(?:\.{1,2}/|/)?(?:[\w.@-]+[/\\])*[\w.@-]+\.(?:rs|ts|tsx|js|jsx|mjs|cjs|py|go|java|kt|rb|php|cs|c|cc|cpp|h|hpp|swift|vue|svelte)\b)"#,
        )
        .ok();

        Self {
            detectors,
            file_pattern,
        }
    }

    /// Classify raw verification output. Never fails.
    #[must_use]
    pub fn classify(&self, raw_output: &str) -> FailureClassification {
        let (failure_type, summary) = self.detect(raw_output);
        let normalized = normalize_output(raw_output);

        FailureClassification {
            failure_type,
            is_code_fixable: failure_type.is_code_fixable(),
            failure_signature: compute_signature(&normalized),
            summary,
            file_references: self.extract_file_references(raw_output),
        }
    }

    /// Run detectors in priority order; first hit wins.
    fn detect(&self, output: &str) -> (FailureType, String) {
        for (kind, patterns) in &self.detectors {
            for re in patterns {
                if !re.is_match(output) {
                    continue;
                }
                let line = output
                    .lines()
                    .find(|line| re.is_match(line))
                    .or_else(|| output.lines().find(|l| !l.trim().is_empty()))
                    .unwrap_or_default();
                return (*kind, truncate_summary(line));
            }
        }

        let first = output
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(truncate_summary)
            .unwrap_or_else(|| "Unknown failure".to_string());
        (FailureType::Unknown, first)
    }

    /// Extract path-like source file references, de-duplicated.
    fn extract_file_references(&self, output: &str) -> Vec<String> {
        let Some(ref re) = self.file_pattern else {
            return Vec::new();
        };

        let mut refs: Vec<String> = Vec::new();
        for caps in re.captures_iter(output) {
            let Some(m) = caps.get(1) else { continue };
            let path = m.as_str();
            if path.contains("node_modules/") || path.contains(".cargo/registry") {
                continue;
            }
            if !refs.iter().any(|r| r == path) {
                refs.push(path.to_string());
            }
        }
        refs
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn default_classifier() -> &'static FailureClassifier {
    static CLASSIFIER: OnceLock<FailureClassifier> = OnceLock::new();
    CLASSIFIER.get_or_init(FailureClassifier::new)
}

/// Classify raw output with the shared default classifier.
#[must_use]
pub fn classify_failure(raw_output: &str) -> FailureClassification {
    default_classifier().classify(raw_output)
}
