//! Executor Configuration
//!
//! Defaults applied when a workflow does not say otherwise. Workflow
//! `settings` override the global values here; step fields override both.

use std::time::Duration;

/// Default per-attempt step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default budget for a whole run.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period after sending before the first readiness poll.
pub const DEFAULT_IDLE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Base delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Scrollback lines captured around a prompt.
pub const DEFAULT_CAPTURE_LINES: usize = 2000;

/// Runtime configuration for an [`Executor`](super::Executor).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Terminal session that hosts the agents
    pub session: String,
    pub default_timeout: Duration,
    pub global_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_debounce: Duration,
    pub default_retry_delay: Duration,
    pub capture_lines: usize,
    /// Route and log steps without sending anything
    pub dry_run: bool,
    /// Fixed run id instead of a generated one
    pub run_id: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            session: "main".to_string(),
            default_timeout: DEFAULT_STEP_TIMEOUT,
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_debounce: DEFAULT_IDLE_DEBOUNCE,
            default_retry_delay: DEFAULT_RETRY_DELAY,
            capture_lines: DEFAULT_CAPTURE_LINES,
            dry_run: false,
            run_id: None,
        }
    }
}

impl ExecutorConfig {
    /// Creates a default configuration for a session.
    pub fn for_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::default()
        }
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    pub fn set_global_timeout(&mut self, timeout: Duration) {
        self.global_timeout = timeout;
    }

    /// Sets the readiness poll interval (clamped to at least 10ms).
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_millis(10));
    }

    pub fn set_idle_debounce(&mut self, debounce: Duration) {
        self.idle_debounce = debounce;
    }

    pub fn set_default_retry_delay(&mut self, delay: Duration) {
        self.default_retry_delay = delay;
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn set_run_id(&mut self, run_id: impl Into<String>) {
        self.run_id = Some(run_id.into());
    }
}
