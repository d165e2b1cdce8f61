//! Individual Step Execution
//!
//! Runs one step to a terminal result:
//! - guard condition (skip without consuming an attempt)
//! - prompt resolution and variable substitution
//! - pane selection
//! - send, wait and capture, retried with backoff
//! - optional output parsing

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::ExecutorConfig;
use super::engine::Collaborators;
use super::progress::{fraction, ProgressKind, ProgressSink};
use super::routing::{extract_new_output, select_pane, truncate_prompt, ClaimSet};
use super::state::{ErrorKind, ExecutionError, ExecutionState, ExecutionStatus, StepError, StepResult};
use crate::expr::ExprError;
use crate::workflow::{format_duration, Settings, Step, WaitPolicy};

/// Shown instead of the prompt in dry-run output.
const DRY_RUN_PREVIEW_CHARS: usize = 100;

/// Outcome of one send/wait/capture attempt.
enum Attempt {
    Completed(String),
    Cancelled(&'static str),
    Failed(StepError),
}

/// Why waiting for an idle agent stopped early.
enum WaitError {
    Cancelled,
    TimedOut(String),
}

/// Everything a run shares with the tasks that execute its steps.
#[derive(Clone)]
pub(crate) struct StepRunner {
    pub config: Arc<ExecutorConfig>,
    pub collaborators: Collaborators,
    pub state: Arc<RwLock<ExecutionState>>,
    pub progress: ProgressSink,
    pub settings: Settings,
    pub base_dir: Option<PathBuf>,
    /// Graph size, sub-steps included
    pub total: usize,
}

impl StepRunner {
    /// Share of steps that reached a terminal status.
    pub async fn progress(&self) -> f64 {
        fraction(self.state.read().await.terminal_count(), self.total)
    }

    pub async fn emit(&self, kind: ProgressKind, step_id: &str, message: impl Into<String>) {
        let progress = self.progress().await;
        self.progress.emit(kind, step_id, message, progress);
    }

    /// Executes a top-level step or parallel group.
    pub async fn run_step(&self, step: &Step, token: &CancellationToken) -> StepResult {
        if token.is_cancelled() {
            return StepResult::cancelled(&step.id, "run cancelled");
        }
        if let Some(result) = self.check_guard(step).await {
            return result;
        }
        if step.is_parallel() {
            return self.execute_group(step, token).await;
        }
        self.execute_single(step, token, None).await
    }

    /// Evaluates the `when` guard.
    ///
    /// Returns a terminal result when the step must not run: skipped if the
    /// condition is false, failed if it cannot be evaluated.
    pub async fn check_guard(&self, step: &Step) -> Option<StepResult> {
        let condition = step.when.as_deref()?;

        match self.evaluate_condition(condition).await {
            Ok(false) => None,
            Ok(true) => {
                let reason = format!("condition '{}' evaluated to false", condition);
                info!("Skipping step '{}': {}", step.id, reason);
                let result = StepResult::skipped(&step.id, reason.clone());
                self.emit(ProgressKind::StepSkip, &step.id, reason).await;
                Some(result)
            }
            Err(e) => {
                let message = format!("failed to evaluate when condition: {}", e);
                error!("Step '{}': {}", step.id, message);
                self.emit(ProgressKind::StepError, &step.id, message.clone()).await;
                Some(StepResult::started(&step.id).fail(StepError::new(ErrorKind::Condition, message)))
            }
        }
    }

    async fn evaluate_condition(&self, condition: &str) -> Result<bool, ExprError> {
        let substituted = {
            let state = self.state.read().await;
            self.collaborators.substitutor.substitute(condition, &state)?
        };
        self.collaborators.conditions.evaluate(&substituted)
    }

    /// Executes a non-group step with retries.
    ///
    /// The prompt is resolved and the pane selected once; only the
    /// send/wait/capture cycle is retried.
    pub async fn execute_single(
        &self,
        step: &Step,
        token: &CancellationToken,
        claims: Option<&ClaimSet>,
    ) -> StepResult {
        let mut result = StepResult::started(&step.id);

        let prompt = match self.resolve_prompt(step).await {
            Ok(prompt) => prompt,
            Err(e) => return self.fail(step, result, e).await,
        };

        let selection = match select_pane(&self.config, &self.collaborators, step, &prompt, claims).await {
            Ok(selection) => selection,
            Err(e) => {
                let error = StepError::new(ErrorKind::Routing, format!("failed to select pane: {}", e));
                return self.fail(step, result, error).await;
            }
        };
        result.pane_used = Some(selection.pane_id.clone());
        result.agent_type = Some(selection.agent_type.clone());

        if self.config.dry_run {
            result.attempts = 1;
            result.output = format!(
                "[DRY RUN] Would execute: {}",
                truncate_prompt(&prompt, DRY_RUN_PREVIEW_CHARS)
            );
            return self.complete(step, result).await;
        }

        let max_attempts = step.max_attempts();
        let base_delay = step.retry_delay.unwrap_or(self.config.default_retry_delay);

        for attempt in 1..=max_attempts {
            result.attempts = attempt;
            info!(
                "Starting step '{}' on {} (attempt {}/{})",
                step.id, selection.pane_id, attempt, max_attempts
            );
            self.emit(
                ProgressKind::StepStart,
                &step.id,
                format!(
                    "Sending to {} (attempt {}/{})",
                    selection.agent_type, attempt, max_attempts
                ),
            )
            .await;

            let error = match self.attempt(step, &selection.pane_id, &prompt, token).await {
                Attempt::Completed(output) => {
                    result.output = output;
                    result.error = None;
                    return self.complete(step, result).await;
                }
                Attempt::Cancelled(reason) => {
                    info!("Step '{}' cancelled: {}", step.id, reason);
                    result.skip_reason = Some(reason.to_string());
                    return result.finish(ExecutionStatus::Cancelled);
                }
                Attempt::Failed(error) => error.at_attempt(attempt),
            };

            let retry = attempt < max_attempts && error.kind.is_retryable();
            result.error = Some(error.clone());
            if !retry {
                break;
            }

            let delay = step.retry_backoff.delay(base_delay, attempt);
            warn!(
                "Step '{}' attempt {} failed: {}. Retrying in {}",
                step.id,
                attempt,
                error.message,
                format_duration(delay)
            );
            self.emit(
                ProgressKind::StepRetry,
                &step.id,
                format!("Step {} failed, retrying in {}", step.id, format_duration(delay)),
            )
            .await;

            tokio::select! {
                _ = token.cancelled() => {
                    result.skip_reason = Some("cancelled during retry backoff".to_string());
                    return result.finish(ExecutionStatus::Cancelled);
                }
                _ = sleep(delay) => {}
            }
        }

        let message = result
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        error!(
            "Step '{}' failed after {} attempt(s): {}",
            step.id, result.attempts, message
        );
        self.emit(
            ProgressKind::StepError,
            &step.id,
            format!("Step {} failed after {} attempts: {}", step.id, result.attempts, message),
        )
        .await;
        result.finish(ExecutionStatus::Failed)
    }

    /// Sends the prompt once, waits per the step's policy and captures output.
    async fn attempt(&self, step: &Step, pane_id: &str, prompt: &str, token: &CancellationToken) -> Attempt {
        if token.is_cancelled() {
            return Attempt::Cancelled("cancelled before send");
        }

        let terminal = &self.collaborators.terminal;
        let before = tokio::select! {
            _ = token.cancelled() => return Attempt::Cancelled("cancelled before send"),
            captured = terminal.capture_output(pane_id, self.config.capture_lines) => {
                captured.unwrap_or_default()
            }
        };
        if token.is_cancelled() {
            return Attempt::Cancelled("cancelled before send");
        }

        self.collaborators.detector.reset(pane_id);
        if let Err(e) = terminal.send(pane_id, prompt, true).await {
            return Attempt::Failed(StepError::new(
                ErrorKind::Send,
                format!("failed to send prompt: {}", e),
            ));
        }

        let timeout = step.timeout.unwrap_or(self.config.default_timeout);
        match step.wait {
            WaitPolicy::None => return Attempt::Completed(String::new()),
            WaitPolicy::Time => {
                tokio::select! {
                    _ = token.cancelled() => return Attempt::Cancelled("cancelled during wait"),
                    _ = sleep(timeout) => {}
                }
            }
            WaitPolicy::Completion | WaitPolicy::Idle => {
                match self.wait_for_idle(pane_id, timeout, token).await {
                    Ok(()) => {}
                    Err(WaitError::Cancelled) => return Attempt::Cancelled("cancelled during wait"),
                    Err(WaitError::TimedOut(detail)) => {
                        return Attempt::Failed(StepError::new(
                            ErrorKind::Timeout,
                            format!("timeout waiting for completion: {}", detail),
                        ))
                    }
                }
            }
        }

        match terminal.capture_output(pane_id, self.config.capture_lines).await {
            Ok(after) => Attempt::Completed(extract_new_output(&before, &after)),
            Err(e) => Attempt::Failed(StepError::new(
                ErrorKind::Capture,
                format!("failed to capture output: {}", e),
            )),
        }
    }

    /// Polls the readiness detector until the agent is idle.
    ///
    /// The agent is given `idle_debounce` to start working first. Detector
    /// errors are tolerated until the deadline.
    async fn wait_for_idle(
        &self,
        pane_id: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), WaitError> {
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            _ = token.cancelled() => return Err(WaitError::Cancelled),
            _ = &mut deadline => return Err(WaitError::TimedOut(format!("timeout after {}", format_duration(timeout)))),
            _ = sleep(self.config.idle_debounce) => {}
        }

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_error: Option<String> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(WaitError::Cancelled),
                _ = &mut deadline => {
                    let mut detail = format!("timeout after {}", format_duration(timeout));
                    if let Some(e) = &last_error {
                        detail.push_str(&format!(" (last detector error: {})", e));
                    }
                    return Err(WaitError::TimedOut(detail));
                }
                _ = ticker.tick() => {
                    match self.collaborators.detector.detect(pane_id).await {
                        Ok(status) if status.is_idle() => return Ok(()),
                        Ok(status) => debug!("Pane {} is {}", pane_id, status.state),
                        Err(e) => {
                            debug!("Readiness check for {} failed: {}", pane_id, e);
                            last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Reads the prompt text or file and substitutes variables.
    async fn resolve_prompt(&self, step: &Step) -> Result<String, StepError> {
        let raw = match (&step.prompt, &step.prompt_file) {
            (Some(prompt), _) => prompt.clone(),
            (None, Some(file)) => {
                let path = match &self.base_dir {
                    Some(dir) if file.is_relative() => dir.join(file),
                    _ => file.clone(),
                };
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    StepError::new(
                        ErrorKind::Prompt,
                        format!("failed to read prompt file {}: {}", path.display(), e),
                    )
                })?
            }
            (None, None) => return Err(StepError::new(ErrorKind::Prompt, "step has no prompt")),
        };

        let state = self.state.read().await;
        self.collaborators
            .substitutor
            .substitute(&raw, &state)
            .map_err(|e| StepError::new(ErrorKind::Prompt, format!("failed to resolve prompt: {}", e)))
    }

    /// Parses output if configured and stamps the result completed.
    async fn complete(&self, step: &Step, mut result: StepResult) -> StepResult {
        if step.output_parse.is_enabled() && !self.config.dry_run {
            match self.collaborators.parser.parse(&result.output, &step.output_parse) {
                Ok(data) => result.parsed_data = Some(data),
                Err(e) => {
                    let message = format!("failed to parse output: {}", e);
                    warn!("Step '{}': {}", step.id, message);
                    self.state.write().await.push_error(ExecutionError::warning(
                        Some(step.id.as_str()),
                        ErrorKind::Parse,
                        message,
                    ));
                }
            }
        }

        let result = result.finish(ExecutionStatus::Completed);
        info!("Step '{}' completed", step.id);
        self.emit(ProgressKind::StepComplete, &step.id, format!("Step {} completed", step.id))
            .await;
        result
    }

    async fn fail(&self, step: &Step, result: StepResult, error: StepError) -> StepResult {
        error!("Step '{}' failed: {}", step.id, error.message);
        self.emit(ProgressKind::StepError, &step.id, error.message.clone()).await;
        result.fail(error)
    }
}
