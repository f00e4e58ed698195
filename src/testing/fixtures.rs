//! Canned verification output.
//!
//! Each constant classifies to the failure type its name says.

/// Jest assertion failure.
pub const ASSERTION_FAILURE: &str = "FAIL src/math.test.ts
  ● add › adds numbers

    expect(received).toBe(expected)

    Expected 1 to be 2

      at Object.<anonymous> (src/math.test.ts:4:17)
Time: 1.92 s
";

/// Same assertion, different run metadata.
pub const ASSERTION_FAILURE_RERUN: &str = "FAIL src/math.test.ts
  ● add › adds numbers

    expect(received).toBe(expected)

    Expected 1 to be 2

      at Object.<anonymous> (src/math.test.ts:4:17)
Time: 2.48 s
";

/// TypeScript compiler error.
pub const TYPE_ERROR: &str =
    "src/user.ts(12,5): error TS2322: Type 'string' is not assignable to type 'number'.\n";

/// ESLint report.
pub const LINT_ERROR: &str = "/repo/src/app.ts
  3:10  error  'unused' is assigned a value but never used  no-unused-vars

✖ 1 problem (1 error, 0 warnings)
eslint found problems
";

/// rustc compile error.
pub const COMPILE_ERROR: &str = "error[E0425]: cannot find value `x` in this scope
 --> src/main.rs:2:13
error: could not compile `demo` due to previous error
";

/// Missing test dependency.
pub const MISSING_MODULE: &str = "Error: Cannot find module 'jest'
Require stack:
- /home/dev/project/node_modules/.bin/jest
";

/// Test command that hung.
pub const TIMED_OUT: &str = "Test run timed out after 30000 ms\n";

/// Output that matches no detector.
pub const UNRECOGNIZED: &str = "something odd happened\n";

/// A distinct assertion failure for iteration `n`.
#[must_use]
pub fn assertion_failure_in(n: u32) -> String {
    format!("FAIL src/step{n}.test.ts\n  Expected {n} to be {}\n", n + 1)
}
