//! Workflow Execution Module
//!
//! Provides the executor that runs workflow steps against agents,
//! including dependency scheduling, retries, parallel groups,
//! cancellation and progress reporting.
//!
//! # Architecture
//!
//! - [`engine`]: Run loop and the public [`Executor`]
//! - [`step`]: Single-step execution with retry
//! - [`parallel`]: Parallel-group coordination
//! - [`routing`]: Pane selection and output extraction
//! - [`state`]: Per-run results, variables and error log

pub mod config;
pub mod engine;
pub mod error;
mod parallel;
pub mod progress;
pub mod routing;
pub mod state;
pub mod step;

#[cfg(test)]
pub(crate) mod fakes;

pub use config::ExecutorConfig;
pub use engine::{Executor, RunReport};
pub use error::ExecutorError;
pub use progress::{ProgressEvent, ProgressKind};
pub use routing::extract_new_output;
pub use state::{
    generate_run_id, ErrorKind, ExecutionError, ExecutionState, ExecutionStatus, StepError,
    StepResult,
};
