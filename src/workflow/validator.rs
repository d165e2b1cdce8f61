//! Workflow Validation
//!
//! Static checks run before anything is sent to an agent:
//! - Workflow header (schema version, name, non-empty)
//! - Step identifiers (format, uniqueness)
//! - Step shape (prompt vs parallel, one targeting mode)
//! - Output parsing configuration
//! - Dependency structure (unknown references, cycles)
//!
//! Problems that would make the run fail are errors; suspicious but
//! runnable configurations are reported as warnings.

use std::collections::HashSet;
use std::fmt;

use log::warn;
use regex::Regex;

use super::graph::{DependencyGraph, DependencyIssue};
use super::model::{OnError, ParseKind, Step, Workflow, SCHEMA_VERSION};
use crate::expr::condition::check_syntax;
use crate::expr::substitute::variable_references;

/// Namespaces the default substitutor understands.
const KNOWN_NAMESPACES: &[&str] = &[
    "vars",
    "steps",
    "env",
    "loop",
    "session",
    "run_id",
    "timestamp",
    "workflow",
];

/// Validation errors that can occur in workflow definitions.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Workflow contains no steps
    EmptyWorkflow,
    /// Workflow has no name
    MissingName,
    /// Schema version is not supported
    UnsupportedSchema(String),
    /// Step ID is empty or contains invalid characters
    InvalidStepId(String),
    /// Step has neither a prompt nor sub-steps
    MissingPrompt(String),
    /// Step sets both a prompt and sub-steps
    PromptAndParallel(String),
    /// Step sets both `prompt` and `prompt_file`
    PromptAndPromptFile(String),
    /// Step sets more than one of agent/pane/route
    ConflictingTarget(String),
    /// Sub-step of a group is itself a group
    NestedParallel(String),
    /// Regex output parsing without a usable pattern
    InvalidParsePattern { step: String, reason: String },
    /// Structural problem in the dependency graph
    Dependency(DependencyIssue),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyWorkflow => write!(f, "Workflow has no steps"),
            ValidationError::MissingName => write!(f, "Workflow has no name"),
            ValidationError::UnsupportedSchema(v) => write!(
                f,
                "Unsupported schema version '{}' (expected '{}')",
                v, SCHEMA_VERSION
            ),
            ValidationError::InvalidStepId(id) => write!(
                f,
                "Invalid step id '{}': use letters, digits, '_' or '-'",
                id
            ),
            ValidationError::MissingPrompt(id) => {
                write!(f, "Step '{}' needs a prompt, prompt_file or parallel block", id)
            }
            ValidationError::PromptAndParallel(id) => {
                write!(f, "Step '{}' cannot have both a prompt and a parallel block", id)
            }
            ValidationError::PromptAndPromptFile(id) => {
                write!(f, "Step '{}' cannot have both prompt and prompt_file", id)
            }
            ValidationError::ConflictingTarget(id) => {
                write!(f, "Step '{}' may set only one of agent, pane or route", id)
            }
            ValidationError::NestedParallel(id) => {
                write!(f, "Step '{}': parallel groups cannot be nested", id)
            }
            ValidationError::InvalidParsePattern { step, reason } => {
                write!(f, "Step '{}': invalid output_parse pattern: {}", step, reason)
            }
            ValidationError::Dependency(issue) => write!(f, "{}", issue),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Outcome of validating a workflow.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Returns true if no errors were found.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts the report into a result, joining errors into one message.
    pub fn into_result(self) -> Result<(), String> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        Err(format!(
            "Workflow validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    }
}

/// Validates a workflow definition.
///
/// Collects every problem rather than stopping at the first one.
///
/// # Arguments
///
/// * `workflow` - The workflow to check
///
/// # Returns
///
/// A report holding errors (the workflow must not run) and warnings.
pub fn validate_workflow(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    if workflow.schema_version != SCHEMA_VERSION {
        report
            .errors
            .push(ValidationError::UnsupportedSchema(workflow.schema_version.clone()));
    }
    if workflow.name.trim().is_empty() {
        report.errors.push(ValidationError::MissingName);
    }
    if workflow.is_empty() {
        report.errors.push(ValidationError::EmptyWorkflow);
        return report;
    }

    for step in &workflow.steps {
        report.errors.extend(validate_step(step));
        report.warnings.extend(step_warnings(step, false));

        for sub in &step.parallel {
            if sub.is_parallel() {
                report.errors.push(ValidationError::NestedParallel(sub.id.clone()));
            }
            report.errors.extend(validate_step(sub));
            report.warnings.extend(step_warnings(sub, true));
        }
    }

    if let Err(issues) = DependencyGraph::build(workflow) {
        report
            .errors
            .extend(issues.into_iter().map(ValidationError::Dependency));
    }

    for (name, def) in &workflow.vars {
        if def.required && def.default.is_none() {
            report.warnings.push(format!(
                "Variable '{}' is required and has no default; it must be supplied at run time",
                name
            ));
        }
    }

    let declared: HashSet<&str> = workflow.vars.keys().map(String::as_str).collect();
    for step in workflow.all_steps() {
        report
            .warnings
            .extend(reference_warnings(step, &declared));
    }

    report
}

/// Validates the shape of a single step.
pub fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !is_valid_id(&step.id) {
        errors.push(ValidationError::InvalidStepId(step.id.clone()));
    }

    let has_prompt = step.prompt.is_some() || step.prompt_file.is_some();
    if has_prompt && step.is_parallel() {
        errors.push(ValidationError::PromptAndParallel(step.id.clone()));
    } else if !has_prompt && !step.is_parallel() {
        errors.push(ValidationError::MissingPrompt(step.id.clone()));
    }

    if step.prompt.is_some() && step.prompt_file.is_some() {
        errors.push(ValidationError::PromptAndPromptFile(step.id.clone()));
    }

    let targets = [step.agent.is_some(), step.pane.is_some(), step.route.is_some()];
    if targets.iter().filter(|t| **t).count() > 1 {
        errors.push(ValidationError::ConflictingTarget(step.id.clone()));
    }

    if step.output_parse.kind == ParseKind::Regex {
        match step.output_parse.pattern.as_deref() {
            None | Some("") => errors.push(ValidationError::InvalidParsePattern {
                step: step.id.clone(),
                reason: "regex parsing requires a pattern".to_string(),
            }),
            Some(pattern) => {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(ValidationError::InvalidParsePattern {
                        step: step.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    errors
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn step_warnings(step: &Step, in_group: bool) -> Vec<String> {
    let mut warnings = Vec::new();

    if step.on_error == Some(OnError::Retry) && step.retry_count == 0 {
        warnings.push(format!(
            "Step '{}': on_error is retry but retry_count is 0",
            step.id
        ));
    }

    if step.on_error == Some(OnError::FailFast) && !step.is_parallel() && !in_group {
        warnings.push(format!(
            "Step '{}': fail_fast only applies to parallel groups; behaves like fail",
            step.id
        ));
    }

    if let Some(condition) = &step.when {
        for issue in check_syntax(condition) {
            warnings.push(format!("Step '{}': when condition has {}", step.id, issue));
        }
    }

    warnings
}

fn reference_warnings(step: &Step, declared: &HashSet<&str>) -> Vec<String> {
    let mut warnings = Vec::new();
    let texts = [step.prompt.as_deref(), step.when.as_deref()];

    for text in texts.into_iter().flatten() {
        for reference in variable_references(text) {
            let mut parts = reference.split('.');
            let namespace = parts.next().unwrap_or_default();
            if !KNOWN_NAMESPACES.contains(&namespace) {
                warnings.push(format!(
                    "Step '{}': unknown variable namespace '{}' in '${{{}}}'",
                    step.id, namespace, reference
                ));
            } else if namespace == "vars" {
                if let Some(name) = parts.next() {
                    if !declared.contains(name) {
                        warnings.push(format!(
                            "Step '{}': variable '{}' is not declared in vars",
                            step.id, name
                        ));
                    }
                }
            }
        }
    }

    warnings
}

/// Validates a workflow and logs its warnings.
///
/// # Returns
///
/// * `Ok(())` - No errors (warnings may have been logged)
/// * `Err` - Joined error messages
pub fn validate_and_log(workflow: &Workflow) -> Result<(), String> {
    let report = validate_workflow(workflow);
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    report.into_result()
}
