//! Output-Stability Readiness Detector
//!
//! Treats an agent as idle once the tail of its pane stops changing between
//! two consecutive checks. Agents stream output while working, so a stable
//! screen is a reliable sign that the agent is waiting for input.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::trace;

use super::{AgentError, AgentState, AgentStatus, ReadinessDetector, TerminalClient};

/// Lines compared between checks.
const TAIL_LINES: usize = 40;

/// Readiness detector comparing successive pane captures.
pub struct StabilityDetector {
    terminal: Arc<dyn TerminalClient>,
    last_seen: Mutex<HashMap<String, String>>,
}

impl StabilityDetector {
    pub fn new(terminal: Arc<dyn TerminalClient>) -> Self {
        Self {
            terminal,
            last_seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ReadinessDetector for StabilityDetector {
    async fn detect(&self, pane_id: &str) -> Result<AgentStatus, AgentError> {
        let capture = self
            .terminal
            .capture_output(pane_id, TAIL_LINES)
            .await
            .map_err(|e| AgentError::Detection(e.to_string()))?;
        let tail = capture.trim_end().to_string();

        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let previous = last_seen.insert(pane_id.to_string(), tail.clone());

        let state = match previous {
            _ if tail.is_empty() => AgentState::Unknown,
            None => AgentState::Unknown,
            Some(prev) if prev == tail => AgentState::Idle,
            Some(_) => AgentState::Busy,
        };
        trace!("Pane {} readiness: {}", pane_id, state);

        Ok(AgentStatus::new(state))
    }

    /// Forgets the previous capture, so the next check cannot report idle.
    fn reset(&self, pane_id: &str) {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pane_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Pane;
    use std::collections::VecDeque;

    /// Returns queued captures in order, repeating the last one.
    struct ScriptedTerminal {
        captures: Mutex<VecDeque<String>>,
    }

    impl ScriptedTerminal {
        fn new(captures: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                captures: Mutex::new(captures.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl TerminalClient for ScriptedTerminal {
        async fn list_panes(&self, _session: &str) -> Result<Vec<Pane>, AgentError> {
            Ok(Vec::new())
        }

        async fn send(&self, _pane: &str, _text: &str, _enter: bool) -> Result<(), AgentError> {
            Ok(())
        }

        async fn capture_output(&self, _pane: &str, _lines: usize) -> Result<String, AgentError> {
            let mut captures = self.captures.lock().unwrap();
            if captures.len() > 1 {
                Ok(captures.pop_front().unwrap())
            } else {
                Ok(captures.front().cloned().unwrap_or_default())
            }
        }
    }

    #[tokio::test]
    async fn test_stable_output_is_idle() {
        let detector = StabilityDetector::new(ScriptedTerminal::new(&["working...", "done\n> ", "done\n> "]));

        assert_eq!(detector.detect("%1").await.unwrap().state, AgentState::Unknown);
        assert_eq!(detector.detect("%1").await.unwrap().state, AgentState::Busy);
        assert!(detector.detect("%1").await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_empty_pane_is_unknown() {
        let detector = StabilityDetector::new(ScriptedTerminal::new(&[""]));
        detector.detect("%1").await.unwrap();
        assert_eq!(detector.detect("%1").await.unwrap().state, AgentState::Unknown);
    }

    #[tokio::test]
    async fn test_reset_forgets_pane() {
        let detector = StabilityDetector::new(ScriptedTerminal::new(&["same"]));
        detector.detect("%2").await.unwrap();
        detector.reset("%2");
        assert_eq!(detector.detect("%2").await.unwrap().state, AgentState::Unknown);
        assert!(detector.detect("%2").await.unwrap().is_idle());
    }
}
