//! Paneflow - Workflow Executor for Terminal Agents
//!
//! Runs multi-step workflows against AI coding agents that live in
//! terminal-multiplexer panes: prompts are typed into a pane, the agent is
//! watched until it goes idle, and its reply is captured for later steps.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`workflow`]: Workflow definitions, parsing, validation and the dependency graph
//! - [`execution`]: The executor, step runner and parallel groups
//! - [`agents`]: Terminal, readiness, scoring and routing collaborators
//! - [`expr`]: Variable substitution, guard conditions and output parsing
//! - [`monitoring`]: Post-run timeline reports
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use paneflow::execution::{Executor, ExecutorConfig};
//! use paneflow::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("review.yaml")?;
//!
//!     // Drive the agents of tmux session "agents"
//!     let executor = Executor::with_tmux(ExecutorConfig::for_session("agents"));
//!
//!     // Execute the workflow
//!     let state = executor.run(&workflow, HashMap::new(), None).await.into_result()?;
//!     println!("{} steps recorded", state.steps.len());
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod execution;
pub mod expr;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use execution::{ExecutionState, ExecutionStatus, Executor, ExecutorConfig, ExecutorError, RunReport};
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Paneflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Paneflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("review", "Review the diff");
        assert_eq!(step.id, "review");
        assert_eq!(step.prompt.as_deref(), Some("Review the diff"));
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new("empty");
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
