//! Pipeline diagnostics and progress reporting.
//!
//! The controller never formats log lines itself. It emits [`PipelineEvent`]s
//! keyed by phase and repository through an [`EventSink`], and reports
//! fractional progress through a [`ProgressSink`].

use serde::Serialize;
use uuid::Uuid;

/// Where in a run an event happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    DiskCheck,
    Checkpoint,
    Transfer,
    Retry,
    Record,
    Summary,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::DiskCheck => write!(f, "disk_check"),
            Phase::Checkpoint => write!(f, "checkpoint"),
            Phase::Transfer => write!(f, "transfer"),
            Phase::Retry => write!(f, "retry"),
            Phase::Record => write!(f, "record"),
            Phase::Summary => write!(f, "summary"),
        }
    }
}

/// One structured diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub run_id: Option<Uuid>,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub message: String,
}

impl PipelineEvent {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            run_id: None,
            phase,
            repo: None,
            attempt: None,
            message: message.into(),
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Narrow logging interface the pipeline reports through.
pub trait EventSink: Send + Sync {
    fn info(&self, event: &PipelineEvent);
    fn error(&self, event: &PipelineEvent);
}

/// Renders events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn info(&self, event: &PipelineEvent) {
        tracing::info!(
            run_id = ?event.run_id,
            phase = %event.phase,
            repo = event.repo.as_deref().unwrap_or("-"),
            attempt = ?event.attempt,
            "{}",
            event.message
        );
    }

    fn error(&self, event: &PipelineEvent) {
        tracing::error!(
            run_id = ?event.run_id,
            phase = %event.phase,
            repo = event.repo.as_deref().unwrap_or("-"),
            attempt = ?event.attempt,
            "{}",
            event.message
        );
    }
}

/// Receives run progress as a percentage in `0.0..=100.0`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, percent: f64) {
        self(percent)
    }
}

/// Discards progress reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_builder() {
        let run = Uuid::new_v4();
        let event = PipelineEvent::new(Phase::Retry, "connection reset")
            .with_run(run)
            .with_repo("octo/alpha")
            .with_attempt(2);
        assert_eq!(event.run_id, Some(run));
        assert_eq!(event.repo.as_deref(), Some("octo/alpha"));
        assert_eq!(event.attempt, Some(2));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["phase"], "retry");
    }

    #[test]
    fn test_closure_is_a_progress_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: f64| seen.lock().unwrap().push(p);
        sink.report(50.0);
        NoProgress.report(10.0);
        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }
}
