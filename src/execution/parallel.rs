//! Parallel Groups
//!
//! Runs the sub-steps of a group as concurrent tasks. The group decides how
//! sub-step failures escalate:
//! - `fail`: let every sub-step finish, then fail the group
//! - `fail_fast`: cancel sub-steps still waiting or running after the first failure
//! - `continue`: succeed with a tally of failures
//!
//! Sub-steps share a claim set so no two of them are routed to the same pane
//! while enough panes exist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressKind;
use super::routing::ClaimSet;
use super::state::{ErrorKind, ExecutionStatus, StepError, StepResult};
use super::step::StepRunner;
use crate::workflow::{format_duration, OnError, Step};

impl StepRunner {
    /// Executes every sub-step of `group` and aggregates their results.
    ///
    /// Each sub-step result is recorded under its own id as soon as it
    /// finishes. The group returns only after every worker has finished.
    pub async fn execute_group(&self, group: &Step, token: &CancellationToken) -> StepResult {
        let mut result = StepResult::started(&group.id);
        let on_error = group.effective_on_error(&self.settings);
        let total = group.parallel.len();

        let group_token = token.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = group.timeout.map(|limit| {
            let group_token = group_token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = group_token.cancelled() => {}
                    _ = sleep(limit) => {
                        timed_out.store(true, Ordering::SeqCst);
                        group_token.cancel();
                    }
                }
            })
        });

        info!("Starting parallel group '{}' with {} steps", group.id, total);
        self.emit(
            ProgressKind::ParallelStart,
            &group.id,
            format!("Starting {} parallel steps", total),
        )
        .await;

        let claims = ClaimSet::default();
        let mut handles = Vec::with_capacity(total);

        for sub in &group.parallel {
            let runner = self.clone();
            let sub = sub.clone();
            let sub_id = sub.id.clone();
            let parent = token.clone();
            let group_token = group_token.clone();
            let timed_out = Arc::clone(&timed_out);
            let claims = Arc::clone(&claims);

            let handle = tokio::spawn(async move {
                let result = if group_token.is_cancelled() {
                    StepResult::cancelled(&sub.id, cancel_reason(&parent, &timed_out))
                } else {
                    match runner.check_guard(&sub).await {
                        Some(result) => result,
                        None => runner.execute_single(&sub, &group_token, Some(&claims)).await,
                    }
                };

                {
                    let mut state = runner.state.write().await;
                    if result.is_success() {
                        state.publish_output(&result, sub.output_var.as_deref());
                    }
                    state.record_result(result.clone());
                }

                if result.status == ExecutionStatus::Failed && on_error == OnError::FailFast {
                    warn!("Sub-step '{}' failed, cancelling remaining sub-steps", sub.id);
                    group_token.cancel();
                }
                result
            });
            handles.push((sub_id, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (sub_id, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("Worker for sub-step '{}' did not finish: {}", sub_id, e);
                    let failed = StepResult::started(&sub_id).fail(StepError::new(
                        ErrorKind::Internal,
                        format!("sub-step worker failed: {}", e),
                    ));
                    self.state.write().await.record_result(failed.clone());
                    results.push(failed);
                }
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let failed = count(&results, ExecutionStatus::Failed);
        let cancelled = count(&results, ExecutionStatus::Cancelled);
        let completed = count(&results, ExecutionStatus::Completed);
        result.parsed_data = Some(aggregate(&results));

        let outcome = if token.is_cancelled() {
            Err((ErrorKind::Cancelled, "run cancelled".to_string()))
        } else if timed_out.load(Ordering::SeqCst) {
            let limit = group.timeout.map(format_duration).unwrap_or_default();
            Err((
                ErrorKind::ParallelTimeout,
                format!("parallel group timed out after {}", limit),
            ))
        } else if failed == 0 {
            Ok(format!("All {} parallel steps completed", total))
        } else {
            match on_error {
                OnError::Continue => Ok(format!(
                    "Parallel group completed with {}/{} successful",
                    completed, total
                )),
                OnError::FailFast => Err((
                    ErrorKind::ParallelFailFast,
                    format!("{} failed, {} cancelled (fail_fast mode)", failed, cancelled),
                )),
                OnError::Fail | OnError::Retry => Err((
                    ErrorKind::Parallel,
                    format!("{} of {} parallel steps failed", failed, total),
                )),
            }
        };

        match outcome {
            Ok(summary) => {
                info!("Parallel group '{}': {}", group.id, summary);
                result.attempts = 1;
                result.output = summary;
                self.emit(ProgressKind::StepComplete, &group.id, result.output.clone())
                    .await;
                result.finish(ExecutionStatus::Completed)
            }
            Err((ErrorKind::Cancelled, reason)) => {
                info!("Parallel group '{}' cancelled", group.id);
                result.skip_reason = Some(reason);
                result.finish(ExecutionStatus::Cancelled)
            }
            Err((kind, message)) => {
                error!("Parallel group '{}' failed: {}", group.id, message);
                result.attempts = 1;
                result.output = message.clone();
                self.emit(ProgressKind::StepError, &group.id, message.clone()).await;
                result.fail(StepError::new(kind, message).at_attempt(1))
            }
        }
    }
}

/// Reason recorded for a sub-step that never started.
fn cancel_reason(parent: &CancellationToken, timed_out: &AtomicBool) -> &'static str {
    if parent.is_cancelled() {
        "run cancelled"
    } else if timed_out.load(Ordering::SeqCst) {
        "parallel group timed out"
    } else {
        "cancelled due to parallel group failure"
    }
}

fn count(results: &[StepResult], status: ExecutionStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}

/// `{sub_id: {output, status, parsed_data}}` for every sub-step.
fn aggregate(results: &[StepResult]) -> Value {
    let map: Map<String, Value> = results
        .iter()
        .map(|r| {
            let entry = json!({
                "output": r.output,
                "status": r.status.as_str(),
                "parsed_data": r.parsed_data.clone().unwrap_or(Value::Null),
            });
            (r.step_id.clone(), entry)
        })
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fakes::{runner, FakeDetector, FakeTerminal};
    use crate::workflow::{OutputParse, ParseKind, WaitPolicy};
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn group(on_error: OnError, steps: Vec<Step>) -> Step {
        Step::group("g", steps).with_on_error(on_error)
    }

    #[tokio::test]
    async fn test_sub_steps_get_distinct_panes() {
        let terminal = FakeTerminal::with_agents(3);
        let (runner, state) = runner(terminal, FakeDetector::idle());

        let g = group(
            OnError::Fail,
            vec![Step::new("a", "one"), Step::new("b", "two"), Step::new("c", "three")],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.output, "All 3 parallel steps completed");

        let state = state.read().await;
        let panes: HashSet<_> = ["a", "b", "c"]
            .iter()
            .map(|id| state.steps[*id].pane_used.clone().unwrap())
            .collect();
        assert_eq!(panes.len(), 3);
    }

    #[tokio::test]
    async fn test_claimed_panes_are_reused_when_exhausted() {
        let terminal = FakeTerminal::with_agents(1);
        let (runner, state) = runner(terminal.clone(), FakeDetector::idle());

        let g = group(OnError::Fail, vec![Step::new("a", "one"), Step::new("b", "two")]);
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let state = state.read().await;
        assert_eq!(state.steps["a"].pane_used.as_deref(), Some("%1"));
        assert_eq!(state.steps["b"].pane_used.as_deref(), Some("%1"));
        assert_eq!(terminal.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings() {
        let terminal = FakeTerminal::with_agents(3);
        terminal.fail_pane("%3");
        let (runner, state) = runner(terminal, FakeDetector::idle());

        let g = group(
            OnError::FailFast,
            vec![
                Step::new("broken", "one").with_agent("gemini"),
                Step::new("slow", "two")
                    .with_agent("claude")
                    .with_wait(WaitPolicy::Time)
                    .with_timeout(Duration::from_secs(10)),
            ],
        );
        let started = Instant::now();
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ParallelFailFast);
        assert_eq!(error.message, "1 failed, 1 cancelled (fail_fast mode)");

        let state = state.read().await;
        assert_eq!(state.steps["broken"].status, ExecutionStatus::Failed);
        assert_eq!(state.steps["slow"].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_unsent_sibling() {
        let terminal = FakeTerminal::with_agents(3);
        terminal.fail_pane("%3");
        terminal.delay_capture("%1", Duration::from_millis(300));
        let (runner, state) = runner(terminal.clone(), FakeDetector::idle());

        let g = group(
            OnError::FailFast,
            vec![
                Step::new("late", "two").with_agent("claude"),
                Step::new("broken", "one").with_agent("gemini"),
            ],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::ParallelFailFast);
        assert_eq!(terminal.send_attempts(), 1);
        assert!(terminal.sent_prompts().is_empty());

        let state = state.read().await;
        assert_eq!(state.steps["broken"].status, ExecutionStatus::Failed);
        let late = &state.steps["late"];
        assert_eq!(late.status, ExecutionStatus::Cancelled);
        assert_eq!(late.skip_reason.as_deref(), Some("cancelled before send"));
    }

    #[tokio::test]
    async fn test_fail_waits_for_all() {
        let terminal = FakeTerminal::with_agents(3);
        terminal.fail_pane("%3");
        let (runner, state) = runner(terminal, FakeDetector::idle());

        let g = group(
            OnError::Fail,
            vec![
                Step::new("broken", "one").with_agent("gemini"),
                Step::new("fine", "two").with_agent("claude"),
            ],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Parallel);
        assert_eq!(state.read().await.steps["fine"].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_continue_reports_tally() {
        let terminal = FakeTerminal::with_agents(3);
        terminal.fail_pane("%3");
        let (runner, _) = runner(terminal, FakeDetector::idle());

        let g = group(
            OnError::Continue,
            vec![
                Step::new("broken", "one").with_agent("gemini"),
                Step::new("fine", "two").with_agent("claude"),
                Step::new("also_fine", "three").with_agent("codex"),
            ],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.output, "Parallel group completed with 2/3 successful");
    }

    #[tokio::test]
    async fn test_group_timeout_bounds_whole_group() {
        let (runner, state) = runner(FakeTerminal::with_agents(2), FakeDetector::busy());

        let mut g = group(
            OnError::Fail,
            vec![
                Step::new("a", "one").with_timeout(Duration::from_secs(10)),
                Step::new("b", "two").with_timeout(Duration::from_secs(10)),
            ],
        );
        g.timeout = Some(Duration::from_millis(100));

        let started = Instant::now();
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::ParallelTimeout);
        let state = state.read().await;
        assert_eq!(state.steps["a"].status, ExecutionStatus::Cancelled);
        assert_eq!(state.steps["b"].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_aggregate_and_sub_step_outputs() {
        let terminal = FakeTerminal::with_agents(2);
        terminal.set_reply("%1", r#"{"issues": 0}"#);
        let (runner, state) = runner(terminal, FakeDetector::idle());

        let g = group(
            OnError::Fail,
            vec![
                Step::new("security", "audit")
                    .with_agent("claude")
                    .with_output("audit", OutputParse::new(ParseKind::Json)),
                Step::new("style", "lint").with_agent("codex"),
            ],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        let data = result.parsed_data.unwrap();
        assert_eq!(data["security"]["status"], "completed");
        assert_eq!(data["security"]["parsed_data"]["issues"], 0);
        assert_eq!(data["style"]["parsed_data"], Value::Null);

        let state = state.read().await;
        assert_eq!(state.variables["audit"], json!({"issues": 0}));
        assert!(state.variables.contains_key("steps.style.output"));
    }

    #[tokio::test]
    async fn test_skipped_sub_step() {
        let (runner, state) = runner(FakeTerminal::with_agents(2), FakeDetector::idle());

        let g = group(
            OnError::Fail,
            vec![
                Step::new("a", "one"),
                Step::new("b", "two").with_when("no"),
            ],
        );
        let result = runner.execute_group(&g, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(state.read().await.steps["b"].status, ExecutionStatus::Skipped);
    }
}
