//! Pane Scorer
//!
//! Ranks the agent panes of a session by how ready they are to take a new
//! prompt. Panes that do not host a known agent, or whose state cannot be
//! read, are returned as excluded so callers can explain the decision.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{AgentError, AgentScorer, AgentState, ReadinessDetector, ScoredAgent, TerminalClient};

const SCORE_IDLE: f64 = 100.0;
const SCORE_UNKNOWN: f64 = 50.0;
const SCORE_BUSY: f64 = 10.0;

/// Scorer built from the terminal's pane list and a readiness detector.
pub struct PaneScorer {
    terminal: Arc<dyn TerminalClient>,
    detector: Arc<dyn ReadinessDetector>,
}

impl PaneScorer {
    pub fn new(terminal: Arc<dyn TerminalClient>, detector: Arc<dyn ReadinessDetector>) -> Self {
        Self { terminal, detector }
    }
}

#[async_trait]
impl AgentScorer for PaneScorer {
    async fn score_agents(&self, session: &str, _prompt: &str) -> Result<Vec<ScoredAgent>, AgentError> {
        let panes = self.terminal.list_panes(session).await?;
        let mut scored = Vec::with_capacity(panes.len());

        for pane in panes {
            let Some(agent_type) = pane.agent_type.clone() else {
                scored.push(ScoredAgent {
                    pane_id: pane.id,
                    agent_type: String::new(),
                    pane_index: pane.index,
                    state: AgentState::Unknown,
                    score: 0.0,
                    excluded: true,
                    exclude_reason: Some("not an agent pane".to_string()),
                });
                continue;
            };

            let (state, exclude_reason) = match self.detector.detect(&pane.id).await {
                Ok(status) if status.state == AgentState::Error => {
                    (AgentState::Error, Some("agent reported an error".to_string()))
                }
                Ok(status) => (status.state, None),
                Err(e) => (AgentState::Error, Some(e.to_string())),
            };

            let score = match state {
                AgentState::Idle => SCORE_IDLE,
                AgentState::Unknown => SCORE_UNKNOWN,
                AgentState::Busy => SCORE_BUSY,
                AgentState::Error => 0.0,
            };

            debug!(
                "Scored pane {} ({}): {} -> {}",
                pane.id, agent_type, state, score
            );

            scored.push(ScoredAgent {
                pane_id: pane.id,
                agent_type,
                pane_index: pane.index,
                state,
                score,
                excluded: exclude_reason.is_some(),
                exclude_reason,
            });
        }

        Ok(scored)
    }
}
