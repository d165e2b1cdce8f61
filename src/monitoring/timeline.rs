//! Execution Timeline
//!
//! Reconstructs when each step ran from a run's recorded results, for
//! post-run reports and Gantt charts.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::execution::{ExecutionState, ExecutionStatus};

/// Width of the chart area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the step-name column.
const NAME_WIDTH: usize = 14;

/// The interval one step occupied.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpan {
    pub step_id: String,
    pub status: ExecutionStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl StepSpan {
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds().max(0)
    }
}

/// Step spans of one run, ordered by start time.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    spans: Vec<StepSpan>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Builds the timeline from every finished step result.
    ///
    /// Skipped and never-started steps have no meaningful span and appear
    /// only in the status tally.
    pub fn from_state(state: &ExecutionState) -> Self {
        let mut spans: Vec<StepSpan> = state
            .steps
            .values()
            .filter(|r| r.status != ExecutionStatus::Skipped)
            .filter_map(|r| {
                r.finished_at.map(|end| StepSpan {
                    step_id: r.step_id.clone(),
                    status: r.status,
                    start: r.started_at,
                    end,
                })
            })
            .collect();
        spans.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.step_id.cmp(&b.step_id)));

        let end_time = state
            .finished_at
            .or_else(|| spans.iter().map(|s| s.end).max())
            .unwrap_or(state.updated_at);

        Self {
            spans,
            start_time: state.started_at,
            end_time,
        }
    }

    pub fn spans(&self) -> &[StepSpan] {
        &self.spans
    }

    /// Total run time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds().max(0)
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each step is shown as a bar indicating when it ran relative to the
    /// whole run. Failed steps are drawn with `x`, cancelled with `-`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed_ms();
        if total == 0 || self.spans.is_empty() {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        for span in &self.spans {
            let offset = (span.start - self.start_time).num_milliseconds().max(0);
            let start_pos = (offset as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;

            let fill = match span.status {
                ExecutionStatus::Failed => "x",
                ExecutionStatus::Cancelled => "-",
                _ => "#",
            };
            let mut bar = " ".repeat(start_pos);
            bar.push_str(&fill.repeat(width));

            output.push_str(&format!(
                "{} |{:width$}| ({} ms)\n",
                truncate(&span.step_id, NAME_WIDTH),
                bar,
                span.duration_ms(),
                width = CHART_WIDTH as usize
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.spans
            .iter()
            .map(|s| (s.step_id.clone(), s.duration_ms()))
            .collect()
    }
}

/// Counts step results per status, e.g. `completed: 3, failed: 1`.
pub fn status_tally(state: &ExecutionState) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for result in state.steps.values() {
        *counts.entry(result.status.as_str()).or_default() += 1;
    }
    counts
        .iter()
        .map(|(status, n)| format!("{}: {}", status, n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders the Gantt chart followed by the status tally.
pub fn render_timeline(state: &ExecutionState) -> String {
    let mut output = ExecutionTimeline::from_state(state).gantt_chart();
    output.push_str(&format!("Steps: {}\n", status_tally(state)));
    output
}

/// Pads or truncates a name to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::StepResult;
    use chrono::Duration;

    fn result(id: &str, status: ExecutionStatus, start_ms: i64, end_ms: i64, base: DateTime<Utc>) -> StepResult {
        let mut result = StepResult::started(id).finish(status);
        result.started_at = base + Duration::milliseconds(start_ms);
        result.finished_at = Some(base + Duration::milliseconds(end_ms));
        result
    }

    fn sample_state() -> ExecutionState {
        let mut state = ExecutionState::new("run-1", "demo");
        let base = state.started_at;
        state.record_result(result("review", ExecutionStatus::Completed, 0, 400, base));
        state.record_result(result("fix", ExecutionStatus::Failed, 400, 1000, base));
        state.record_result(StepResult::skipped("lint", "condition false"));
        state.finished_at = Some(base + Duration::milliseconds(1000));
        state
    }

    #[test]
    fn test_spans_sorted_by_start() {
        let timeline = ExecutionTimeline::from_state(&sample_state());
        let ids: Vec<_> = timeline.spans().iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["review", "fix"]);
        assert_eq!(timeline.elapsed_ms(), 1000);
    }

    #[test]
    fn test_get_durations() {
        let durations = ExecutionTimeline::from_state(&sample_state()).get_durations();
        assert_eq!(durations["review"], 400);
        assert_eq!(durations["fix"], 600);
        assert!(!durations.contains_key("lint"));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let chart = ExecutionTimeline::from_state(&sample_state()).gantt_chart();
        assert!(chart.contains("review"));
        assert!(chart.contains("(400 ms)"));
        assert!(chart.contains("xxx"));
        assert!(chart.contains("Total: 1000 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let state = ExecutionState::new("run-2", "empty");
        let chart = ExecutionTimeline::from_state(&state).gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_render_timeline_includes_tally() {
        let rendered = render_timeline(&sample_state());
        assert!(rendered.contains("Steps: completed: 1, failed: 1, skipped: 1"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_very_long_step_name", 10), "a_very_...");
    }
}
