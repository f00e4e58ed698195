//! Consecutive failure tracking.
//!
//! Counts how many times in a row the same failure signature has been seen.

use serde::{Deserialize, Serialize};

/// Counter over consecutive identical failure signatures.
///
/// # Example
///
/// ```
/// use mend::repair::tracker::ConsecutiveFailureTracker;
///
/// let mut tracker = ConsecutiveFailureTracker::new();
/// tracker.record_failure("abc");
/// tracker.record_failure("abc");
/// assert!(tracker.has_repeated_failure(2));
///
/// tracker.record_failure("def");
/// assert_eq!(tracker.count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsecutiveFailureTracker {
    count: u32,
    previous_signature: Option<String>,
}

impl ConsecutiveFailureTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from persisted parts.
    #[must_use]
    pub fn from_parts(count: u32, previous_signature: Option<String>) -> Self {
        Self {
            count,
            previous_signature,
        }
    }

    /// Record one failure occurrence.
    pub fn record_failure(&mut self, signature: &str) {
        if self.previous_signature.as_deref() == Some(signature) {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 1;
            self.previous_signature = Some(signature.to_string());
        }
    }

    /// True when the current streak has reached `threshold`.
    #[must_use]
    pub fn has_repeated_failure(&self, threshold: u32) -> bool {
        self.count >= threshold
    }

    /// Clear the streak and the remembered signature.
    pub fn reset(&mut self) {
        self.count = 0;
        self.previous_signature = None;
    }

    /// Length of the current streak.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Signature of the most recent failure.
    #[must_use]
    pub fn previous_signature(&self) -> Option<&str> {
        self.previous_signature.as_deref()
    }

    /// Split into `(count, previous_signature)`.
    #[must_use]
    pub fn into_parts(self) -> (u32, Option<String>) {
        (self.count, self.previous_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker_is_empty() {
        let tracker = ConsecutiveFailureTracker::new();
        assert_eq!(tracker.count(), 0);
        assert!(tracker.previous_signature().is_none());
        assert!(!tracker.has_repeated_failure(1));
    }

    #[test]
    fn test_same_signature_increments() {
        let mut tracker = ConsecutiveFailureTracker::new();
        tracker.record_failure("sig");
        assert_eq!(tracker.count(), 1);
        assert!(!tracker.has_repeated_failure(2));

        tracker.record_failure("sig");
        assert_eq!(tracker.count(), 2);
        assert!(tracker.has_repeated_failure(2));
    }

    #[test]
    fn test_different_signature_resets_to_one() {
        let mut tracker = ConsecutiveFailureTracker::new();
        tracker.record_failure("a");
        tracker.record_failure("a");
        tracker.record_failure("b");
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.previous_signature(), Some("b"));
        assert!(!tracker.has_repeated_failure(2));
    }

    #[test]
    fn test_alternating_never_repeats() {
        let mut tracker = ConsecutiveFailureTracker::new();
        for sig in ["a", "b", "a", "b"] {
            tracker.record_failure(sig);
            assert!(!tracker.has_repeated_failure(2));
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = ConsecutiveFailureTracker::new();
        tracker.record_failure("a");
        tracker.record_failure("a");
        tracker.reset();
        assert_eq!(tracker.count(), 0);
        assert!(tracker.previous_signature().is_none());

        tracker.record_failure("a");
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn test_parts_round_trip() {
        let tracker = ConsecutiveFailureTracker::from_parts(3, Some("x".into()));
        let (count, prev) = tracker.into_parts();
        assert_eq!(count, 3);
        assert_eq!(prev.as_deref(), Some("x"));
    }
}
