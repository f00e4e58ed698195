//! Repair loop events and sinks.
//!
//! Events are a side channel. The runner publishes them fire-and-forget
//! through [`EventSink::publish`], which is synchronous and infallible from the
//! runner's point of view: control flow never waits on observers.
//!
//! All events serialize as tagged JSON, e.g.
//! `{"type":"repair_attempt_started","taskId":"t1","iteration":1,...}`.

use crate::repair::classifier::FailureClassification;
use crate::repair::decision::{DecisionOption, StopReason};
use crate::repair::state::RunnerStage;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Terminal stop of a repair loop, always paired with a decision menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEvent {
    pub task_id: String,
    pub reason: StopReason,
    pub decision_options: Vec<DecisionOption>,
    /// Diffs applied before stopping.
    pub iteration: u32,
    pub repair_remaining: u32,
    pub last_failure: Option<FailureClassification>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the runner reports while working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairEvent {
    #[serde(rename_all = "camelCase")]
    FailureClassified {
        task_id: String,
        iteration: u32,
        classification: FailureClassification,
    },
    #[serde(rename_all = "camelCase")]
    RepairAttemptStarted {
        task_id: String,
        iteration: u32,
        repair_remaining: u32,
    },
    #[serde(rename_all = "camelCase")]
    DiagnosisCompleted {
        task_id: String,
        iteration: u32,
        root_cause: String,
    },
    #[serde(rename_all = "camelCase")]
    DiffProposed {
        task_id: String,
        iteration: u32,
        diff_id: String,
        files_affected: Vec<String>,
        empty: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScopeExpansionRequested {
        task_id: String,
        iteration: u32,
        diff_id: String,
        files: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    DiffApplied {
        task_id: String,
        iteration: u32,
        diff_id: String,
        repair_remaining: u32,
    },
    #[serde(rename_all = "camelCase")]
    StageTimedOut {
        task_id: String,
        stage: RunnerStage,
        will_retry: bool,
    },
    #[serde(rename_all = "camelCase")]
    VerificationPassed { task_id: String, iteration: u32 },
    RepairLoopStopped(StopEvent),
}

impl RepairEvent {
    /// Snake-case event name, matching the serialized `type` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FailureClassified { .. } => "failure_classified",
            Self::RepairAttemptStarted { .. } => "repair_attempt_started",
            Self::DiagnosisCompleted { .. } => "diagnosis_completed",
            Self::DiffProposed { .. } => "diff_proposed",
            Self::ScopeExpansionRequested { .. } => "scope_expansion_requested",
            Self::DiffApplied { .. } => "diff_applied",
            Self::StageTimedOut { .. } => "stage_timed_out",
            Self::VerificationPassed { .. } => "verification_passed",
            Self::RepairLoopStopped(_) => "repair_loop_stopped",
        }
    }

    /// Task the event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::FailureClassified { task_id, .. }
            | Self::RepairAttemptStarted { task_id, .. }
            | Self::DiagnosisCompleted { task_id, .. }
            | Self::DiffProposed { task_id, .. }
            | Self::ScopeExpansionRequested { task_id, .. }
            | Self::DiffApplied { task_id, .. }
            | Self::StageTimedOut { task_id, .. }
            | Self::VerificationPassed { task_id, .. } => task_id,
            Self::RepairLoopStopped(stop) => &stop.task_id,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives published events. Must not block for long.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RepairEvent);
}

/// Mirrors events into the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: RepairEvent) {
        match &event {
            RepairEvent::FailureClassified { classification, .. } => info!(
                task = event.task_id(),
                failure_type = %classification.failure_type,
                signature = %classification.failure_signature,
                "Failure classified: {}",
                classification.summary
            ),
            RepairEvent::RepairLoopStopped(stop) => info!(
                task = event.task_id(),
                reason = %stop.reason,
                iteration = stop.iteration,
                "Repair loop stopped"
            ),
            other => debug!(task = other.task_id(), event = other.name(), "Repair event"),
        }
    }
}

/// Forwards events over an unbounded tokio channel.
///
/// A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: UnboundedSender<RepairEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: UnboundedSender<RepairEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: RepairEvent) {
        let _ = self.sender.send(event);
    }
}

/// Appends events as JSON lines to a file.
///
/// Each write takes an exclusive lock so concurrent loops on different tasks
/// can share one log. Write failures are logged, never raised.
#[derive(Debug, Clone)]
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &RepairEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file)?;

        let json = serde_json::to_string(event)?;
        let result = writeln!(file, "{}", json);
        let _ = FileExt::unlock(&file);
        result?;
        Ok(())
    }

    /// Read every event back from the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a valid event.
    pub fn read_events(&self) -> anyhow::Result<Vec<RepairEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
            .collect()
    }
}

impl EventSink for JsonlEventSink {
    fn publish(&self, event: RepairEvent) {
        if let Err(e) = self.append(&event) {
            warn!("Could not write event to {}: {}", self.path.display(), e);
        }
    }
}

/// Publishes every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutEventSink {
    fn publish(&self, event: RepairEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::decision::{generate_decision_options, DecisionContext};
    use tempfile::TempDir;

    fn started(task: &str) -> RepairEvent {
        RepairEvent::RepairAttemptStarted {
            task_id: task.into(),
            iteration: 1,
            repair_remaining: 2,
        }
    }

    fn stopped() -> RepairEvent {
        RepairEvent::RepairLoopStopped(StopEvent {
            task_id: "t".into(),
            reason: StopReason::BudgetExhausted,
            decision_options: generate_decision_options(
                StopReason::BudgetExhausted,
                &DecisionContext::default(),
            ),
            iteration: 2,
            repair_remaining: 0,
            last_failure: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(started("t1")).unwrap();
        assert_eq!(json["type"], "repair_attempt_started");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["repairRemaining"], 2);
    }

    #[test]
    fn test_stop_event_serializes_flat() {
        let json = serde_json::to_value(stopped()).unwrap();
        assert_eq!(json["type"], "repair_loop_stopped");
        assert_eq!(json["reason"], "budget_exhausted");
        assert!(json["decisionOptions"].as_array().unwrap().len() >= 2);
    }

    #[test]
    fn test_name_matches_tag() {
        for event in [started("t"), stopped()] {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.name());
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_ignores_closed() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelEventSink::new(tx);
        sink.publish(started("a"));
        assert_eq!(rx.recv().await.unwrap().task_id(), "a");

        drop(rx);
        sink.publish(started("b"));
    }

    #[test]
    fn test_jsonl_sink_appends_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlEventSink::new(temp.path().join("logs/events.jsonl"));
        sink.publish(started("a"));
        sink.publish(stopped());

        let events = sink.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], started("a"));
        assert_eq!(events[1].name(), "repair_loop_stopped");
    }

    #[test]
    fn test_jsonl_sink_missing_file_reads_empty() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlEventSink::new(temp.path().join("none.jsonl"));
        assert!(sink.read_events().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        let fanout = FanoutEventSink::new()
            .with_sink(Arc::new(ChannelEventSink::new(tx1)))
            .with_sink(Arc::new(ChannelEventSink::new(tx2)))
            .with_sink(Arc::new(TracingEventSink));
        assert_eq!(fanout.len(), 3);

        fanout.publish(started("x"));
        assert_eq!(rx1.recv().await.unwrap().task_id(), "x");
        assert_eq!(rx2.recv().await.unwrap().task_id(), "x");
    }
}
