//! Progress Events
//!
//! State-transition notifications for an optional observer. Delivery never
//! blocks the executor: when the observer's channel is full, the event is
//! dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of transition being reported.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    WorkflowStart,
    WorkflowComplete,
    WorkflowError,
    StepStart,
    StepRetry,
    StepSkip,
    StepComplete,
    StepError,
    ParallelStart,
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressKind::WorkflowStart => "workflow_start",
            ProgressKind::WorkflowComplete => "workflow_complete",
            ProgressKind::WorkflowError => "workflow_error",
            ProgressKind::StepStart => "step_start",
            ProgressKind::StepRetry => "step_retry",
            ProgressKind::StepSkip => "step_skip",
            ProgressKind::StepComplete => "step_complete",
            ProgressKind::StepError => "step_error",
            ProgressKind::ParallelStart => "parallel_start",
        };
        f.write_str(s)
    }
}

/// A single progress notification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// Empty for workflow-level events
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_id: String,
    pub message: String,
    /// Fraction of steps in a terminal status, 0.0 to 1.0
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
}

/// Optional, non-blocking sender of progress events.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self { tx }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Sends an event if an observer is attached and has room.
    pub fn emit(&self, kind: ProgressKind, step_id: &str, message: impl Into<String>, progress: f64) {
        let Some(tx) = &self.tx else {
            return;
        };

        let event = ProgressEvent {
            kind,
            step_id: step_id.to_string(),
            message: message.into(),
            progress: progress.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        };

        if let Err(e) = tx.try_send(event) {
            trace!("Dropping progress event: {}", e);
        }
    }
}

/// Fraction of `total` represented by `done`; an empty workflow is complete.
pub fn fraction(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ProgressSink::new(Some(tx));

        sink.emit(ProgressKind::StepStart, "a", "Executing step a", 0.25);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ProgressKind::StepStart);
        assert_eq!(event.step_id, "a");
        assert_eq!(event.progress, 0.25);
    }

    #[tokio::test]
    async fn test_emit_never_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(Some(tx));

        sink.emit(ProgressKind::StepStart, "a", "first", 0.0);
        sink.emit(ProgressKind::StepComplete, "a", "dropped", 1.0);

        assert_eq!(rx.recv().await.unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_sink() {
        ProgressSink::disabled().emit(ProgressKind::WorkflowStart, "", "ignored", 0.0);
    }

    #[test]
    fn test_fraction() {
        assert_eq!(fraction(0, 0), 1.0);
        assert_eq!(fraction(1, 4), 0.25);
        assert_eq!(fraction(5, 4), 1.0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ProgressKind::StepRetry.to_string(), "step_retry");
        assert_eq!(
            serde_json::to_string(&ProgressKind::WorkflowComplete).unwrap(),
            "\"workflow_complete\""
        );
    }
}
