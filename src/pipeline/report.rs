//! Outcome of one pipeline run.

use serde::Serialize;
use uuid::Uuid;

use crate::ledger::PipelineState;

use super::control::StopReason;

/// A repository that did not complete, with the reason recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRepo {
    pub full_name: String,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Candidates after ignore filtering and the repository limit.
    pub total: usize,
    /// Transferred successfully in this run.
    pub completed: usize,
    /// Already `Completed` in the ledger before this run.
    pub already_done: usize,
    /// Permanent skips (not found, rejected credentials).
    pub skipped: Vec<SkippedRepo>,
    /// Retries exhausted or timed out.
    pub failed: Vec<SkippedRepo>,
    /// Set when the loop left early; the run is resumable.
    pub stopped: Option<StopReason>,
    /// Pipeline state persisted when the run returned.
    pub state: PipelineState,
}

impl RunReport {
    pub(crate) fn new(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id,
            total,
            completed: 0,
            already_done: 0,
            skipped: Vec::new(),
            failed: Vec::new(),
            stopped: None,
            state: PipelineState::Running,
        }
    }

    /// Repositories resolved so far, whatever the outcome.
    pub fn resolved(&self) -> usize {
        self.completed + self.already_done + self.skipped.len() + self.failed.len()
    }

    /// True when every candidate ended up `Completed`.
    pub fn is_clean(&self) -> bool {
        self.stopped.is_none() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_counts_every_outcome() {
        let mut report = RunReport::new(Uuid::new_v4(), 4);
        report.completed = 1;
        report.already_done = 1;
        report.failed.push(SkippedRepo {
            full_name: "octo/c".into(),
            reason: "transient: reset".into(),
            attempts: 3,
        });
        assert_eq!(report.resolved(), 3);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_serializes_stop_reason() {
        let mut report = RunReport::new(Uuid::new_v4(), 1);
        report.stopped = Some(StopReason::Cancelled);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stopped"], "cancelled");
        assert_eq!(json["state"], "running");
    }
}
