//! Mock implementations of the repair collaborators.
//!
//! Every mock is scripted up front with `with_*` builders and records how it
//! was called, so tests can drive the runner through any path
//! deterministically.

use crate::repair::collaborators::{
    ApprovalDecision, ApprovalManager, ApprovalRequest, Diagnosis, DiffApplicator,
    RepairContext, RepairDiffGenerator, RepairDiffProposal, TestFailureInput, TestRunner,
};
use crate::repair::events::{EventSink, RepairEvent, StopEvent};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock verification runner.
///
/// Returns scripted results in order, then repeats the fallback (a pass unless
/// changed).
///
/// # Example
///
/// ```rust,ignore
/// let runner = MockTestRunner::new("npm test")
///     .with_failure("FAIL expected 1 to be 2")
///     .with_pass();
/// ```
#[derive(Debug)]
pub struct MockTestRunner {
    command: String,
    results: Mutex<VecDeque<TestFailureInput>>,
    fallback: TestFailureInput,
    error: Option<String>,
    call_count: AtomicU32,
}

impl MockTestRunner {
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            results: Mutex::new(VecDeque::new()),
            fallback: TestFailureInput::new(command, 0, "ok"),
            error: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Queue a failing run with `output`.
    #[must_use]
    pub fn with_failure(self, output: &str) -> Self {
        lock(&self.results).push_back(TestFailureInput::new(self.command.as_str(), 1, output));
        self
    }

    /// Queue a passing run.
    #[must_use]
    pub fn with_pass(self) -> Self {
        lock(&self.results).push_back(TestFailureInput::new(self.command.as_str(), 0, "ok"));
        self
    }

    /// Fail with `output` on every run once the queue is drained.
    #[must_use]
    pub fn always_failing(mut self, output: &str) -> Self {
        self.fallback = TestFailureInput::new(self.command.as_str(), 1, output);
        self
    }

    /// Make every run error out.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Number of verification runs.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for MockTestRunner {
    async fn run_test(&self) -> Result<TestFailureInput> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(ref error) = self.error {
            bail!("{}", error);
        }
        Ok(lock(&self.results)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// One scripted diff generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockDiff {
    /// A non-empty diff over these files.
    Patch(Vec<String>),
    /// An empty diff.
    Empty,
    /// Sleep before producing the default patch.
    Slow(Duration),
    /// Fail with this message.
    Error(String),
    /// Return this proposal verbatim (the diff id is kept).
    Proposal(RepairDiffProposal),
}

/// Mock diagnosis and diff generator.
///
/// Scripted steps are consumed in order; afterwards every call produces a
/// patch over the default files.
#[derive(Debug)]
pub struct MockDiffGenerator {
    default_files: Vec<String>,
    diff_steps: Mutex<VecDeque<MockDiff>>,
    diagnose_delays: Mutex<VecDeque<Duration>>,
    diagnose_error: Option<String>,
    contexts: Mutex<Vec<RepairContext>>,
    diagnose_count: AtomicU32,
    generate_count: AtomicU32,
}

impl MockDiffGenerator {
    #[must_use]
    pub fn new(default_files: &[&str]) -> Self {
        Self {
            default_files: default_files.iter().map(|f| f.to_string()).collect(),
            diff_steps: Mutex::new(VecDeque::new()),
            diagnose_delays: Mutex::new(VecDeque::new()),
            diagnose_error: None,
            contexts: Mutex::new(Vec::new()),
            diagnose_count: AtomicU32::new(0),
            generate_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_step(self, step: MockDiff) -> Self {
        lock(&self.diff_steps).push_back(step);
        self
    }

    #[must_use]
    pub fn with_patch(self, files: &[&str]) -> Self {
        self.with_step(MockDiff::Patch(files.iter().map(|f| f.to_string()).collect()))
    }

    #[must_use]
    pub fn with_empty_diff(self) -> Self {
        self.with_step(MockDiff::Empty)
    }

    #[must_use]
    pub fn with_slow_diff(self, delay: Duration) -> Self {
        self.with_step(MockDiff::Slow(delay))
    }

    /// Delay the next diagnosis by `delay`.
    #[must_use]
    pub fn with_slow_diagnosis(self, delay: Duration) -> Self {
        lock(&self.diagnose_delays).push_back(delay);
        self
    }

    /// Make every diagnosis error out.
    #[must_use]
    pub fn with_diagnose_error(mut self, error: &str) -> Self {
        self.diagnose_error = Some(error.to_string());
        self
    }

    pub fn diagnose_count(&self) -> u32 {
        self.diagnose_count.load(Ordering::SeqCst)
    }

    pub fn generate_count(&self) -> u32 {
        self.generate_count.load(Ordering::SeqCst)
    }

    /// Contexts passed to `generate_diff`, oldest first.
    pub fn contexts(&self) -> Vec<RepairContext> {
        lock(&self.contexts).clone()
    }

    fn patch(&self, n: u32, files: Vec<String>) -> RepairDiffProposal {
        let unified_diff = files
            .iter()
            .map(|f| format!("--- a/{f}\n+++ b/{f}\n@@ -1 +1 @@\n-old\n+new\n"))
            .collect::<String>();
        RepairDiffProposal {
            diff_id: format!("diff-{n}"),
            unified_diff,
            summary: format!("Patch {} file(s)", files.len()),
            files_affected: files,
        }
    }
}

#[async_trait]
impl RepairDiffGenerator for MockDiffGenerator {
    async fn diagnose(&self, context: &RepairContext) -> Result<Diagnosis> {
        self.diagnose_count.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.diagnose_delays).pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(ref error) = self.diagnose_error {
            bail!("{}", error);
        }
        Ok(Diagnosis {
            root_cause: context.failure.summary.clone(),
            suggested_files: self.default_files.clone(),
        })
    }

    async fn generate_diff(&self, context: &RepairContext) -> Result<RepairDiffProposal> {
        let n = self.generate_count.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.contexts).push(context.clone());

        let step = lock(&self.diff_steps).pop_front();
        match step {
            None => Ok(self.patch(n, self.default_files.clone())),
            Some(MockDiff::Patch(files)) => Ok(self.patch(n, files)),
            Some(MockDiff::Empty) => Ok(RepairDiffProposal {
                diff_id: format!("diff-{n}"),
                unified_diff: String::new(),
                files_affected: Vec::new(),
                summary: "No change".to_string(),
            }),
            Some(MockDiff::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.patch(n, self.default_files.clone()))
            }
            Some(MockDiff::Error(error)) => bail!("{}", error),
            Some(MockDiff::Proposal(proposal)) => Ok(proposal),
        }
    }
}

/// Mock diff applicator.
///
/// Applies cleanly unless scripted otherwise.
#[derive(Debug, Default)]
pub struct MockDiffApplicator {
    results: Mutex<VecDeque<bool>>,
    error: Option<String>,
    applied: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl MockDiffApplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an unclean apply.
    #[must_use]
    pub fn with_stale(self) -> Self {
        lock(&self.results).push_back(false);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Ids of diffs that applied cleanly.
    pub fn applied(&self) -> Vec<String> {
        lock(&self.applied).clone()
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffApplicator for MockDiffApplicator {
    async fn apply_diff(&self, proposal: &RepairDiffProposal) -> Result<bool> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(ref error) = self.error {
            bail!("{}", error);
        }
        let clean = lock(&self.results).pop_front().unwrap_or(true);
        if clean {
            lock(&self.applied).push(proposal.diff_id.clone());
        }
        Ok(clean)
    }
}

/// Mock approval manager with a fixed answer.
///
/// A manager built with [`MockApprovalManager::pending`] never answers, which
/// is how tests exercise cancellation during approval.
#[derive(Debug)]
pub struct MockApprovalManager {
    decision: Option<ApprovalDecision>,
    error: Option<String>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl MockApprovalManager {
    fn with_decision(decision: Option<ApprovalDecision>) -> Self {
        Self {
            decision,
            error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn approving() -> Self {
        Self::with_decision(Some(ApprovalDecision::Approved))
    }

    #[must_use]
    pub fn denying() -> Self {
        Self::with_decision(Some(ApprovalDecision::Denied))
    }

    #[must_use]
    pub fn pending() -> Self {
        Self::with_decision(None)
    }

    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Requests received, oldest first.
    pub fn requests(&self) -> Vec<ApprovalRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ApprovalManager for MockApprovalManager {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalDecision> {
        lock(&self.requests).push(request);
        if let Some(ref error) = self.error {
            bail!("{}", error);
        }
        match self.decision {
            Some(decision) => Ok(decision),
            None => std::future::pending().await,
        }
    }
}

/// Event sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RepairEvent>>,
}

impl RecordingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RepairEvent> {
        lock(&self.events).clone()
    }

    /// Event names in publish order.
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(RepairEvent::name).collect()
    }

    /// How many events named `name` were published.
    pub fn count(&self, name: &str) -> usize {
        lock(&self.events).iter().filter(|e| e.name() == name).count()
    }

    /// The terminal stop event, if any.
    pub fn stop_event(&self) -> Option<StopEvent> {
        lock(&self.events).iter().find_map(|e| match e {
            RepairEvent::RepairLoopStopped(stop) => Some(stop.clone()),
            _ => None,
        })
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: RepairEvent) {
        lock(&self.events).push(event);
    }
}
