//! Batch job state and lifecycle
//!
//! The phase machine is a pure function over `(phase, event)` pairs; the
//! mutable [`BatchJob`] bookkeeping around it is written only by the
//! scheduling side, never by chunk handlers.
//!
//! ## Phase Diagram
//!
//! ```text
//! ┌──────┐
//! │ Idle │◄──────────────── Reset (from any phase)
//! └──┬───┘
//!    │ Start
//!    ▼
//! ┌────────────┐
//! │ Processing │
//! └──┬─────────┘
//!    │
//!    ├── Complete ──► Completed
//!    ├── Fail ──────► Failed
//!    └── Cancel ────► Cancelled
//! ```
//!
//! Terminal phases only leave via `Reset`. Everything else is rejected with
//! [`PhaseError::InvalidTransition`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::progress::ProgressSnapshot;
use crate::retry::{AttemptRecord, RetryExhausted};

/// Lifecycle phase of one batch execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Processing => "processing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a job between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    Complete,
    Fail,
    Cancel,
    Reset,
}

impl PhaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseEvent::Start => "start",
            PhaseEvent::Complete => "complete",
            PhaseEvent::Fail => "fail",
            PhaseEvent::Cancel => "cancel",
            PhaseEvent::Reset => "reset",
        }
    }
}

/// Error type for phase transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
}

/// Apply an event to the current phase.
///
/// Pure function: validates that the event is legal for the phase and
/// returns the next phase.
pub fn apply_transition(phase: Phase, event: PhaseEvent) -> Result<Phase, PhaseError> {
    match (phase, event) {
        (Phase::Idle, PhaseEvent::Start) => Ok(Phase::Processing),
        (Phase::Processing, PhaseEvent::Complete) => Ok(Phase::Completed),
        (Phase::Processing, PhaseEvent::Fail) => Ok(Phase::Failed),
        (Phase::Processing, PhaseEvent::Cancel) => Ok(Phase::Cancelled),
        (_, PhaseEvent::Reset) => Ok(Phase::Idle),
        (phase, event) => Err(PhaseError::InvalidTransition {
            from: phase.as_str(),
            event: event.as_str(),
        }),
    }
}

/// One chunk that exhausted its retries, with the full audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    pub index: usize,
    pub attempts: u32,
    pub error: String,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub history: Vec<AttemptRecord>,
}

impl FailedEntry {
    pub fn from_exhausted(index: usize, exhausted: &RetryExhausted) -> Self {
        let now = Utc::now();
        Self {
            index,
            attempts: exhausted.attempts,
            error: exhausted.error.to_string(),
            first_attempt: exhausted
                .history
                .first()
                .map(|a| a.timestamp)
                .unwrap_or(now),
            last_attempt: exhausted.history.last().map(|a| a.timestamp).unwrap_or(now),
            history: exhausted.history.clone(),
        }
    }
}

/// Mutable state of one batch execution
#[derive(Debug)]
pub struct BatchJob<R> {
    pub phase: Phase,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Per-chunk results, keyed by original index
    pub results: Vec<Option<R>>,
    /// Attempts each chunk took to settle; 0 means never dispatched
    pub attempts: Vec<u32>,
    pub failures: Vec<FailedEntry>,
}

impl<R> Default for BatchJob<R> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<R> BatchJob<R> {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            results: Vec::new(),
            attempts: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Size the bookkeeping for a run over `total` chunks. The phase is left
    /// alone; callers drive it through [`BatchJob::transition`].
    pub fn prepare(&mut self, total: usize) {
        self.total = total;
        self.processed = 0;
        self.succeeded = 0;
        self.failed = 0;
        self.results = (0..total).map(|_| None).collect();
        self.attempts = vec![0; total];
        self.failures.clear();
    }

    pub fn transition(&mut self, event: PhaseEvent) -> Result<(), PhaseError> {
        self.phase = apply_transition(self.phase, event)?;
        Ok(())
    }

    pub fn record_success(&mut self, index: usize, value: R, attempts: u32) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(value);
            self.processed += 1;
            self.succeeded += 1;
        }
        if let Some(count) = self.attempts.get_mut(index) {
            *count = attempts;
        }
    }

    pub fn record_failure(&mut self, entry: FailedEntry) {
        if let Some(count) = self.attempts.get_mut(entry.index) {
            *count = entry.attempts;
        }
        if entry.index < self.total {
            self.processed += 1;
            self.failed += 1;
        }
        self.failures.push(entry);
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot::new(self.processed, self.total)
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Whether every chunk has been attempted to its conclusion.
    pub fn is_settled(&self) -> bool {
        self.processed >= self.total
    }

    /// Successful results in index order, skipping failed slots.
    pub fn success_values(&self) -> impl Iterator<Item = &R> {
        self.results.iter().flatten()
    }
}

impl<R: Clone> BatchJob<R> {
    /// Owned copies of the successes in index order, for merging.
    pub fn cloned_successes(&self) -> Vec<R> {
        self.results.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn happy_path_transitions() {
        let mut phase = Phase::Idle;
        phase = apply_transition(phase, PhaseEvent::Start).expect("idle starts");
        assert_eq!(phase, Phase::Processing);
        phase = apply_transition(phase, PhaseEvent::Complete).expect("processing completes");
        assert_eq!(phase, Phase::Completed);
        assert!(phase.is_terminal());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(apply_transition(Phase::Idle, PhaseEvent::Complete).is_err());
        assert!(apply_transition(Phase::Idle, PhaseEvent::Cancel).is_err());
        assert!(apply_transition(Phase::Completed, PhaseEvent::Start).is_err());
        assert!(apply_transition(Phase::Failed, PhaseEvent::Complete).is_err());
        assert!(apply_transition(Phase::Cancelled, PhaseEvent::Fail).is_err());

        let err = apply_transition(Phase::Completed, PhaseEvent::Start).unwrap_err();
        assert_eq!(
            err,
            PhaseError::InvalidTransition {
                from: "completed",
                event: "start"
            }
        );
    }

    #[test]
    fn reset_returns_to_idle_from_anywhere() {
        for phase in [
            Phase::Idle,
            Phase::Processing,
            Phase::Completed,
            Phase::Failed,
            Phase::Cancelled,
        ] {
            assert_eq!(
                apply_transition(phase, PhaseEvent::Reset).expect("reset always legal"),
                Phase::Idle
            );
        }
    }

    #[test]
    fn job_counters_track_settlement() {
        let mut job: BatchJob<String> = BatchJob::idle();
        job.prepare(3);
        assert_eq!(job.results.len(), 3);
        assert!(!job.is_settled());

        job.record_success(0, "a".to_string(), 1);
        job.record_success(2, "c".to_string(), 2);
        assert_eq!(job.processed, 2);
        assert_eq!(job.succeeded, 2);
        assert_eq!(job.attempts[2], 2);

        let exhausted = RetryExhausted {
            attempts: 3,
            history: Vec::new(),
            error: anyhow!("broken"),
        };
        job.record_failure(FailedEntry::from_exhausted(1, &exhausted));
        assert_eq!(job.processed, 3);
        assert_eq!(job.failed, 1);
        assert!(job.is_settled());
        assert!(job.has_failures());

        assert_eq!(job.progress().percent, 100);
        let successes: Vec<&String> = job.success_values().collect();
        assert_eq!(successes, vec!["a", "c"]);
        assert_eq!(job.cloned_successes(), vec!["a", "c"]);
    }

    #[test]
    fn failed_entry_keeps_audit_fields() {
        let exhausted = RetryExhausted {
            attempts: 2,
            history: vec![
                AttemptRecord {
                    attempt_number: 1,
                    timestamp: Utc::now(),
                    error: "first".to_string(),
                },
                AttemptRecord {
                    attempt_number: 2,
                    timestamp: Utc::now(),
                    error: "second".to_string(),
                },
            ],
            error: anyhow!("second"),
        };
        let entry = FailedEntry::from_exhausted(7, &exhausted);
        assert_eq!(entry.index, 7);
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.history.len(), 2);
        assert!(entry.first_attempt <= entry.last_attempt);
        assert_eq!(entry.error, "second");
    }

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::Processing).expect("serializable"),
            "\"processing\""
        );
        assert_eq!(Phase::Cancelled.to_string(), "cancelled");
    }
}
