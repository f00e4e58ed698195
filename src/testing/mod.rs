//! Testing infrastructure for mend.
//!
//! Scriptable doubles for every repair collaborator plus canned verification
//! output, so the repair loop can be exercised without running real tests or
//! touching a workspace.
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::testing::{MockDiffGenerator, MockTestRunner, fixtures};
//!
//! let runner = MockTestRunner::new("npm test")
//!     .with_failure(fixtures::ASSERTION_FAILURE)
//!     .with_pass();
//!
//! let generator = MockDiffGenerator::new(&["src/math.ts"]).with_empty_diff();
//! ```

pub mod fixtures;
pub mod mocks;

pub use mocks::*;
