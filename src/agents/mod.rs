//! Agent Collaborators
//!
//! Interfaces the executor uses to reach agents, plus the tmux-backed
//! implementations the command-line tool wires in.
//!
//! # Components
//!
//! - [`TerminalClient`]: pane enumeration, key injection, text capture
//! - [`ReadinessDetector`]: is the agent in a pane idle or busy?
//! - [`AgentScorer`]: ranks agent panes for a prompt
//! - [`AgentRouter`]: picks one candidate according to a strategy
//!
//! Implementations:
//!
//! - [`tmux::TmuxClient`]
//! - [`detector::StabilityDetector`]
//! - [`scorer::PaneScorer`]
//! - [`router::StrategyRouter`]

pub mod detector;
pub mod router;
pub mod scorer;
pub mod tmux;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::RoutingStrategy;

pub use detector::StabilityDetector;
pub use router::StrategyRouter;
pub use scorer::PaneScorer;
pub use tmux::TmuxClient;

/// Errors raised by agent collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("pane {0} not found")]
    PaneNotFound(String),

    #[error("readiness detection failed: {0}")]
    Detection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A terminal pane in the agents' session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pane {
    /// Multiplexer pane id, e.g. `%3`
    pub id: String,
    /// Position within the window
    pub index: u32,
    pub title: String,
    /// Foreground command
    pub command: String,
    /// Canonical agent type, if the pane hosts a known agent
    pub agent_type: Option<String>,
}

/// Coarse activity state of an agent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting for input
    Idle,
    /// Working on a prompt
    Busy,
    Error,
    Unknown,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Error => "error",
            AgentState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result of a readiness check.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub state: AgentState,
    pub detail: Option<String>,
}

impl AgentStatus {
    pub fn new(state: AgentState) -> Self {
        Self { state, detail: None }
    }

    pub fn is_idle(&self) -> bool {
        self.state == AgentState::Idle
    }
}

/// An agent pane ranked for routing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScoredAgent {
    pub pane_id: String,
    pub agent_type: String,
    pub pane_index: u32,
    pub state: AgentState,
    /// Higher is better
    pub score: f64,
    pub excluded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_reason: Option<String>,
}

/// Extra information handed to the router.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub step_id: String,
    pub prompt: String,
}

/// The router's pick, with an explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub selected: Option<ScoredAgent>,
    pub reason: String,
    pub fallback_used: bool,
}

/// Pane enumeration, prompt delivery and output capture.
#[async_trait]
pub trait TerminalClient: Send + Sync {
    /// Lists the panes of a session.
    async fn list_panes(&self, session: &str) -> Result<Vec<Pane>, AgentError>;

    /// Types `text` into a pane, optionally followed by Enter.
    async fn send(&self, pane_id: &str, text: &str, with_enter: bool) -> Result<(), AgentError>;

    /// Returns up to `max_lines` lines of a pane's scrollback.
    async fn capture_output(&self, pane_id: &str, max_lines: usize) -> Result<String, AgentError>;
}

/// Reports whether the agent in a pane is ready for more input.
#[async_trait]
pub trait ReadinessDetector: Send + Sync {
    async fn detect(&self, pane_id: &str) -> Result<AgentStatus, AgentError>;

    /// Drops anything remembered about a pane before a new prompt is sent.
    fn reset(&self, _pane_id: &str) {}
}

/// Ranks the agents of a session for a prompt.
#[async_trait]
pub trait AgentScorer: Send + Sync {
    async fn score_agents(&self, session: &str, prompt: &str) -> Result<Vec<ScoredAgent>, AgentError>;
}

/// Picks one candidate according to a routing strategy.
pub trait AgentRouter: Send + Sync {
    fn route(
        &self,
        candidates: &[ScoredAgent],
        strategy: RoutingStrategy,
        context: &RoutingContext,
    ) -> RoutingDecision;
}
