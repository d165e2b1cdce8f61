//! Workflow Execution Engine
//!
//! The run loop that drives a workflow to a terminal status:
//! - Dependency graph construction (nothing runs if it is malformed)
//! - Sequential execution of the ready set, groups fanning out internally
//! - A run-wide cancellation token fired by `cancel()` or the global timeout
//! - Progress events for an optional observer

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::config::ExecutorConfig;
use super::error::ExecutorError;
use super::progress::{fraction, ProgressEvent, ProgressKind, ProgressSink};
use super::state::{
    generate_run_id, ErrorKind, ExecutionError, ExecutionState, ExecutionStatus, StepResult,
};
use super::step::StepRunner;
use crate::agents::{
    AgentRouter, AgentScorer, PaneScorer, ReadinessDetector, StabilityDetector, StrategyRouter,
    TerminalClient, TmuxClient,
};
use crate::expr::{
    ConditionEvaluator, ExpressionEvaluator, OutputParser, StructuredOutputParser, Substitutor,
    TemplateSubstitutor,
};
use crate::workflow::{format_duration, DependencyGraph, GraphError, OnError, Workflow};

/// The executor's external dependencies.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub terminal: Arc<dyn TerminalClient>,
    pub detector: Arc<dyn ReadinessDetector>,
    pub scorer: Arc<dyn AgentScorer>,
    pub router: Arc<dyn AgentRouter>,
    pub substitutor: Arc<dyn Substitutor>,
    pub conditions: Arc<dyn ConditionEvaluator>,
    pub parser: Arc<dyn OutputParser>,
}

impl Collaborators {
    /// Wires the given terminal side with the default text collaborators.
    pub fn new(
        terminal: Arc<dyn TerminalClient>,
        detector: Arc<dyn ReadinessDetector>,
        scorer: Arc<dyn AgentScorer>,
        session: &str,
    ) -> Self {
        Self {
            terminal,
            detector,
            scorer,
            router: Arc::new(StrategyRouter::new()),
            substitutor: Arc::new(TemplateSubstitutor::new(session)),
            conditions: Arc::new(ExpressionEvaluator::new()),
            parser: Arc::new(StructuredOutputParser::new()),
        }
    }
}

/// Outcome of one run: the final state and, unless it completed, why not.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ExecutionState,
    pub error: Option<ExecutorError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<ExecutionState, ExecutorError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// Workflow executor.
///
/// One executor can serve many runs, sequentially or concurrently. Each run
/// gets a fresh [`ExecutionState`] and run id.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use paneflow::execution::{Executor, ExecutorConfig};
/// use paneflow::load_workflow;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = load_workflow("review.yaml")?;
/// let executor = Executor::with_tmux(ExecutorConfig::for_session("agents"));
///
/// let state = executor.run(&workflow, HashMap::new(), None).await.into_result()?;
/// println!("{} finished: {}", state.run_id, state.status);
/// # Ok(())
/// # }
/// ```
pub struct Executor {
    config: Arc<ExecutorConfig>,
    collaborators: Collaborators,
    /// Parent of every run's token; replaced after each `cancel()`
    shutdown: Mutex<CancellationToken>,
}

impl Executor {
    /// Creates an executor over the given terminal, detector and scorer.
    pub fn new(
        config: ExecutorConfig,
        terminal: Arc<dyn TerminalClient>,
        detector: Arc<dyn ReadinessDetector>,
        scorer: Arc<dyn AgentScorer>,
    ) -> Self {
        let collaborators = Collaborators::new(terminal, detector, scorer, &config.session);
        Self {
            config: Arc::new(config),
            collaborators,
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Creates an executor driving agents in a tmux session.
    pub fn with_tmux(config: ExecutorConfig) -> Self {
        let terminal: Arc<dyn TerminalClient> = Arc::new(TmuxClient::new());
        let detector: Arc<dyn ReadinessDetector> =
            Arc::new(StabilityDetector::new(Arc::clone(&terminal)));
        let scorer = Arc::new(PaneScorer::new(Arc::clone(&terminal), Arc::clone(&detector)));
        Self::new(config, terminal, detector, scorer)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn set_router(&mut self, router: Arc<dyn AgentRouter>) {
        self.collaborators.router = router;
    }

    pub fn set_substitutor(&mut self, substitutor: Arc<dyn Substitutor>) {
        self.collaborators.substitutor = substitutor;
    }

    pub fn set_condition_evaluator(&mut self, conditions: Arc<dyn ConditionEvaluator>) {
        self.collaborators.conditions = conditions;
    }

    pub fn set_output_parser(&mut self, parser: Arc<dyn OutputParser>) {
        self.collaborators.parser = parser;
    }

    /// Cancels every run currently in flight on this executor.
    ///
    /// Runs started afterwards are unaffected.
    pub fn cancel(&self) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        info!("Cancelling in-flight runs");
        shutdown.cancel();
        *shutdown = CancellationToken::new();
    }

    fn run_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token()
    }

    /// Executes a workflow.
    ///
    /// Variables are seeded from the workflow's defaults and then overridden
    /// by `inputs`. Progress events go to `progress` when given; a full
    /// channel drops events instead of blocking the run.
    pub async fn run(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> RunReport {
        let token = self.run_token();
        let sink = ProgressSink::new(progress);

        let run_id = self.config.run_id.clone().unwrap_or_else(generate_run_id);
        let mut state = ExecutionState::new(run_id, &workflow.name);
        state.status = ExecutionStatus::Running;
        for (name, var) in &workflow.vars {
            if let Some(default) = &var.default {
                state.variables.insert(name.clone(), default.clone());
            }
        }
        state.variables.extend(inputs);

        let mut graph = match DependencyGraph::build(workflow) {
            Ok(graph) => graph,
            Err(issues) => {
                for issue in &issues {
                    state.push_error(ExecutionError::fatal(
                        None,
                        ErrorKind::Dependency,
                        issue.to_string(),
                    ));
                }
                state.finish(ExecutionStatus::Failed);
                let err = ExecutorError::Dependency(
                    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                );
                error!("Workflow '{}' rejected: {}", workflow.name, err);
                sink.emit(ProgressKind::WorkflowError, "", format!("Workflow failed: {}", err), 0.0);
                return RunReport {
                    state,
                    error: Some(err),
                };
            }
        };

        let limit = workflow.settings.timeout.unwrap_or(self.config.global_timeout);
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(limit) => {
                        warn!("Global timeout of {} reached", format_duration(limit));
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            })
        };

        info!(
            "Starting workflow '{}' (run {}, {} steps, timeout {})",
            workflow.name,
            state.run_id,
            graph.size(),
            format_duration(limit)
        );

        let runner = StepRunner {
            config: Arc::clone(&self.config),
            collaborators: self.collaborators.clone(),
            state: Arc::new(RwLock::new(state)),
            progress: sink.clone(),
            settings: workflow.settings.clone(),
            base_dir: workflow.base_dir.clone(),
            total: graph.size(),
        };
        runner
            .emit(
                ProgressKind::WorkflowStart,
                "",
                format!("Starting workflow {}", workflow.name),
            )
            .await;

        let mut outcome = drive(&runner, &mut graph, &token).await;
        watchdog.abort();
        if outcome.is_err() && timed_out.load(Ordering::SeqCst) {
            outcome = Err(ExecutorError::TimedOut(limit));
        }

        let StepRunner { state, .. } = runner;
        let mut state = match Arc::try_unwrap(state) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().await.clone(),
        };

        match &outcome {
            Ok(()) => state.finish(ExecutionStatus::Completed),
            Err(ExecutorError::TimedOut(limit)) => {
                cancel_remaining(&graph, &mut state, "run timed out");
                state.push_error(ExecutionError::fatal(
                    None,
                    ErrorKind::Timeout,
                    format!("workflow exceeded global timeout of {}", format_duration(*limit)),
                ));
                state.finish(ExecutionStatus::Failed);
            }
            Err(ExecutorError::Cancelled) => {
                cancel_remaining(&graph, &mut state, "run cancelled");
                state.push_error(ExecutionError::fatal(
                    None,
                    ErrorKind::Cancelled,
                    "workflow cancelled",
                ));
                state.finish(ExecutionStatus::Cancelled);
            }
            Err(err @ (ExecutorError::Deadlock { .. } | ExecutorError::Graph(_))) => {
                state.push_error(ExecutionError::fatal(None, ErrorKind::Internal, err.to_string()));
                state.finish(ExecutionStatus::Failed);
            }
            Err(_) => state.finish(ExecutionStatus::Failed),
        }

        match &outcome {
            Ok(()) => {
                info!(
                    "Workflow '{}' completed ({} steps)",
                    workflow.name,
                    state.steps.len()
                );
                sink.emit(ProgressKind::WorkflowComplete, "", "Workflow completed", 1.0);
            }
            Err(err) => {
                error!("Workflow '{}' {}: {}", workflow.name, state.status, err);
                let progress = fraction(state.terminal_count(), graph.size());
                sink.emit(
                    ProgressKind::WorkflowError,
                    "",
                    format!("Workflow failed: {}", err),
                    progress,
                );
            }
        }

        RunReport {
            state,
            error: outcome.err(),
        }
    }
}

/// Executes ready steps one at a time until the graph is exhausted.
async fn drive(
    runner: &StepRunner,
    graph: &mut DependencyGraph,
    token: &CancellationToken,
) -> Result<(), ExecutorError> {
    loop {
        if token.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let ready = graph.ready_steps();
        if ready.is_empty() {
            if graph.is_complete() {
                return Ok(());
            }
            let remaining = graph.size() - graph.executed_count();
            return Err(ExecutorError::Deadlock { remaining });
        }

        for step_id in ready {
            if token.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            let step = graph
                .get_step(&step_id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownStep(step_id.clone()))?;

            runner.state.write().await.current_step = Some(step_id.clone());
            let result = runner.run_step(&step, token).await;
            let status = result.status;
            let error = result.error.clone();

            {
                let mut state = runner.state.write().await;
                if result.is_success() {
                    state.publish_output(&result, step.output_var.as_deref());
                }
                state.record_result(result);

                // Sub-steps the group never launched
                for sub in &step.parallel {
                    if state.steps.contains_key(&sub.id) {
                        continue;
                    }
                    let placeholder = if status == ExecutionStatus::Skipped {
                        StepResult::skipped(&sub.id, "group skipped")
                    } else {
                        StepResult::cancelled(&sub.id, "group did not run")
                    };
                    state.record_result(placeholder);
                }
            }

            for sub in &step.parallel {
                graph.mark_executed(&sub.id)?;
            }
            graph.mark_executed(&step_id)?;

            match status {
                ExecutionStatus::Cancelled if token.is_cancelled() => {
                    return Err(ExecutorError::Cancelled);
                }
                ExecutionStatus::Failed => {
                    let (kind, message) = error
                        .map(|e| (e.kind, e.message))
                        .unwrap_or((ErrorKind::Internal, "step failed".to_string()));

                    // Retries are spent inside the step; an exhausted retry step does not abort.
                    match step.effective_on_error(&runner.settings) {
                        OnError::Continue | OnError::Retry => {
                            warn!("Step '{}' failed, continuing: {}", step_id, message);
                            runner.state.write().await.push_error(ExecutionError::warning(
                                Some(step_id.as_str()),
                                kind,
                                message,
                            ));
                        }
                        OnError::Fail | OnError::FailFast => {
                            runner.state.write().await.push_error(ExecutionError::fatal(
                                Some(step_id.as_str()),
                                kind,
                                message.clone(),
                            ));
                            return Err(ExecutorError::StepFailed { step_id, message });
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Records a cancelled result for every step that never reached one.
fn cancel_remaining(graph: &DependencyGraph, state: &mut ExecutionState, reason: &str) {
    for id in graph.pending_top_level() {
        let subs: Vec<String> = graph
            .get_step(&id)
            .map(|step| step.parallel.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();

        for step_id in std::iter::once(id).chain(subs) {
            if !state.steps.contains_key(&step_id) {
                state.record_result(StepResult::cancelled(&step_id, reason));
            }
        }
    }
}
