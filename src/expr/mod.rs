//! Expressions
//!
//! Text-level collaborators the executor calls around each step:
//!
//! - [`Substitutor`]: expands `${...}` references in prompts and conditions
//! - [`ConditionEvaluator`]: decides whether a `when` guard skips a step
//! - [`OutputParser`]: turns captured agent output into structured data
//!
//! The default implementations are [`substitute::TemplateSubstitutor`],
//! [`condition::ExpressionEvaluator`] and [`output::StructuredOutputParser`].

pub mod condition;
pub mod output;
pub mod substitute;

use serde_json::Value;
use thiserror::Error;

use crate::execution::ExecutionState;
use crate::workflow::OutputParse;

pub use condition::ExpressionEvaluator;
pub use output::StructuredOutputParser;
pub use substitute::TemplateSubstitutor;

/// Errors raised while expanding, evaluating or parsing text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("variable substitution error for '{reference}': {message}")]
    Substitution { reference: String, message: String },

    #[error("condition error: {0}")]
    Condition(String),

    #[error("output parse error: {0}")]
    Parse(String),
}

/// Expands variable references against the live execution state.
pub trait Substitutor: Send + Sync {
    fn substitute(&self, text: &str, state: &ExecutionState) -> Result<String, ExprError>;
}

/// Evaluates an already-substituted guard condition.
///
/// Returns `true` when the step should be skipped.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str) -> Result<bool, ExprError>;
}

/// Parses captured output according to a step's parse settings.
pub trait OutputParser: Send + Sync {
    fn parse(&self, text: &str, spec: &OutputParse) -> Result<Value, ExprError>;
}
