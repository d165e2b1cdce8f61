//! In-memory collaborators for executor tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::config::ExecutorConfig;
use super::engine::{Collaborators, Executor};
use super::progress::ProgressSink;
use super::state::ExecutionState;
use super::step::StepRunner;
use crate::agents::{
    AgentError, AgentScorer, AgentState, AgentStatus, Pane, ReadinessDetector, ScoredAgent,
    TerminalClient,
};
use crate::workflow::Settings;

const AGENT_TYPES: &[&str] = &["claude", "codex", "gemini"];

#[derive(Default)]
struct Panes {
    panes: Vec<Pane>,
    buffers: HashMap<String, String>,
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    capture_delays: HashMap<String, Duration>,
    sent: Vec<(String, String)>,
    fail_next: usize,
    attempts: usize,
}

/// A session whose panes echo every prompt followed by a canned reply.
#[derive(Clone, Default)]
pub struct FakeTerminal {
    inner: Arc<Mutex<Panes>>,
}

impl FakeTerminal {
    /// Panes `%1..=%n` hosting claude, codex and gemini in turn.
    pub fn with_agents(n: u32) -> Self {
        let terminal = Self::default();
        {
            let mut inner = terminal.lock();
            for index in 1..=n {
                let agent = AGENT_TYPES[(index as usize - 1) % AGENT_TYPES.len()];
                inner.panes.push(Pane {
                    id: format!("%{}", index),
                    index,
                    title: agent.to_string(),
                    command: agent.to_string(),
                    agent_type: Some(agent.to_string()),
                });
            }
        }
        terminal
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Panes> {
        self.inner.lock().unwrap()
    }

    pub fn set_reply(&self, pane_id: &str, reply: &str) {
        self.lock().replies.insert(pane_id.to_string(), reply.to_string());
    }

    /// Every send to this pane fails.
    pub fn fail_pane(&self, pane_id: &str) {
        self.lock().failing.insert(pane_id.to_string());
    }

    /// The next `n` sends fail regardless of pane.
    pub fn fail_next_sends(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Captures of this pane take `delay` to answer.
    pub fn delay_capture(&self, pane_id: &str, delay: Duration) {
        self.lock().capture_delays.insert(pane_id.to_string(), delay);
    }

    /// Prompts delivered successfully, in order.
    pub fn sent_prompts(&self) -> Vec<String> {
        self.lock().sent.iter().map(|(_, text)| text.clone()).collect()
    }

    /// Delivery attempts, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn panes(&self) -> Vec<Pane> {
        self.lock().panes.clone()
    }
}

#[async_trait]
impl TerminalClient for FakeTerminal {
    async fn list_panes(&self, _session: &str) -> Result<Vec<Pane>, AgentError> {
        Ok(self.panes())
    }

    async fn send(&self, pane_id: &str, text: &str, _with_enter: bool) -> Result<(), AgentError> {
        let mut inner = self.lock();
        inner.attempts += 1;

        if inner.fail_next > 0 || inner.failing.contains(pane_id) {
            inner.fail_next = inner.fail_next.saturating_sub(1);
            return Err(AgentError::Command {
                command: "send-keys".to_string(),
                message: "pane unavailable".to_string(),
            });
        }

        let reply = inner
            .replies
            .get(pane_id)
            .cloned()
            .unwrap_or_else(|| "done".to_string());
        inner
            .buffers
            .entry(pane_id.to_string())
            .or_default()
            .push_str(&format!("\n> {}\n{}", text, reply));
        inner.sent.push((pane_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn capture_output(&self, pane_id: &str, _max_lines: usize) -> Result<String, AgentError> {
        let delay = self.lock().capture_delays.get(pane_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.lock().buffers.get(pane_id).cloned().unwrap_or_default())
    }
}

/// Readiness detector with a fixed answer that counts its calls.
#[derive(Clone)]
pub struct FakeDetector {
    idle: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
}

impl FakeDetector {
    pub fn idle() -> Self {
        Self {
            idle: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicUsize::new(0)),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn busy() -> Self {
        let detector = Self::idle();
        detector.idle.store(false, Ordering::SeqCst);
        detector
    }
}

#[async_trait]
impl ReadinessDetector for FakeDetector {
    async fn detect(&self, _pane_id: &str) -> Result<AgentStatus, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = if self.idle.load(Ordering::SeqCst) {
            AgentState::Idle
        } else {
            AgentState::Busy
        };
        Ok(AgentStatus::new(state))
    }

    fn reset(&self, _pane_id: &str) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scores every pane of a [`FakeTerminal`] equally.
pub struct FakeScorer {
    terminal: FakeTerminal,
}

#[async_trait]
impl AgentScorer for FakeScorer {
    async fn score_agents(&self, _session: &str, _prompt: &str) -> Result<Vec<ScoredAgent>, AgentError> {
        Ok(self
            .terminal
            .panes()
            .into_iter()
            .map(|pane| ScoredAgent {
                agent_type: pane.agent_type.unwrap_or_default(),
                pane_id: pane.id,
                pane_index: pane.index,
                state: AgentState::Idle,
                score: 100.0,
                excluded: false,
                exclude_reason: None,
            })
            .collect())
    }
}

/// Short intervals so tests finish quickly.
pub fn fast_config() -> ExecutorConfig {
    let mut config = ExecutorConfig::for_session("test");
    config.set_poll_interval(Duration::from_millis(10));
    config.set_idle_debounce(Duration::ZERO);
    config.set_default_retry_delay(Duration::from_millis(10));
    config.set_default_timeout(Duration::from_secs(2));
    config.set_global_timeout(Duration::from_secs(30));
    config
}

pub fn collaborators(terminal: FakeTerminal, detector: FakeDetector, session: &str) -> Collaborators {
    let scorer = FakeScorer {
        terminal: terminal.clone(),
    };
    Collaborators::new(Arc::new(terminal), Arc::new(detector), Arc::new(scorer), session)
}

/// A step runner over fresh state, returned with a handle to that state.
pub fn runner(terminal: FakeTerminal, detector: FakeDetector) -> (StepRunner, Arc<RwLock<ExecutionState>>) {
    let config = fast_config();
    let state = Arc::new(RwLock::new(ExecutionState::new("run-test", "test")));
    let runner = StepRunner {
        collaborators: collaborators(terminal, detector, &config.session),
        config: Arc::new(config),
        state: Arc::clone(&state),
        progress: ProgressSink::disabled(),
        settings: Settings::default(),
        base_dir: None,
        total: 10,
    };
    (runner, state)
}

pub fn executor(terminal: FakeTerminal, detector: FakeDetector) -> Executor {
    executor_with(fast_config(), terminal, detector)
}

pub fn executor_with(config: ExecutorConfig, terminal: FakeTerminal, detector: FakeDetector) -> Executor {
    let scorer = FakeScorer {
        terminal: terminal.clone(),
    };
    Executor::new(config, Arc::new(terminal), Arc::new(detector), Arc::new(scorer))
}
