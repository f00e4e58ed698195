//! Bounded self-correction for failing verification.
//!
//! - [`classifier`] turns raw test output into a typed, signed classification
//! - [`tracker`] counts identical consecutive failures
//! - [`policy`] holds the pure stop-condition and state-transition rules
//! - [`runner`] drives the classify/diagnose/generate/apply/re-verify loop
//!
//! Everything the runner needs from the outside world comes in through the
//! traits in [`collaborators`]; everything it reports goes out through
//! [`events`].

pub mod cancel;
pub mod classifier;
pub mod collaborators;
pub mod decision;
pub mod events;
pub mod policy;
pub mod runner;
pub mod scope;
pub mod state;
pub mod tracker;

pub use cancel::CancellationToken;
pub use classifier::{
    classify_failure, compute_signature, normalize_output, FailureClassification,
    FailureClassifier, FailureType,
};
pub use collaborators::{
    files_in_diff, ApprovalDecision, ApprovalManager, ApprovalRequest, ApprovalType, Diagnosis,
    DiffApplicator, RepairAttempt, RepairCapabilities, RepairContext, RepairDiffGenerator,
    RepairDiffProposal, TestFailureInput, TestRunner,
};
pub use decision::{
    generate_decision_options, DecisionAction, DecisionContext, DecisionOption, StopReason,
};
pub use events::{
    ChannelEventSink, EventSink, FanoutEventSink, JsonlEventSink, RepairEvent, StopEvent,
    TracingEventSink,
};
pub use policy::{
    check_stop_conditions, create_repair_loop_state, grant_budget_extension, StopCheck,
    StopSignals, EMPTY_DIFF_LIMIT,
};
pub use runner::SelfCorrectionRunner;
pub use scope::AllowedFiles;
pub use state::{RepairLoopState, RunnerStage};
pub use tracker::ConsecutiveFailureTracker;
