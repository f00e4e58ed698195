//! mend - bounded self-correction for failing verification
//!
//! When a test, typecheck, lint, or build command fails, mend classifies the
//! output, asks a diff generator for a repair, applies it, and re-runs the
//! command. The loop is bounded: it stops on a budget, on repeated identical
//! failures, on environment problems no code change can fix, and on repeated
//! timeouts or empty diffs, always handing a human a menu of next steps.
//!
//! # Architecture
//!
//! - [`repair`] - Classifier, failure tracker, policy, and the runner
//! - [`config`] - Policy and project configuration
//! - [`operations`] - Real collaborators backed by processes and `git apply`
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Mock collaborators and canned output for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::repair::{RepairCapabilities, SelfCorrectionRunner, TestFailureInput};
//! use mend::RepairPolicy;
//!
//! let runner = SelfCorrectionRunner::new("task-1", RepairPolicy::default(), capabilities);
//! let failure = TestFailureInput::new("npm test", 1, output);
//! match runner.start_repair_loop(failure, &allowed, "npm test").await? {
//!     None => println!("fixed"),
//!     Some(stop) => println!("stopped: {}", stop.reason),
//! }
//! ```

pub mod config;
pub mod error;
pub mod operations;
pub mod repair;
pub mod testing;

// Re-export commonly used types
pub use config::{MendConfig, RepairPolicy};
pub use error::{MendError, Result};
pub use repair::{
    classify_failure, normalize_output, FailureClassification, FailureType, RepairEvent,
    SelfCorrectionRunner, StopEvent, StopReason,
};
