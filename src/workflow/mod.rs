//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading and
//! validating agent workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow, policies)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Static validation rules
//! - [`graph`]: Dependency graph and ready-set tracking

pub mod graph;
pub mod model;
pub mod parser;
pub mod validator;

pub use graph::{DependencyGraph, DependencyIssue, GraphError};
pub use model::{
    format_duration, normalize_agent_type, parse_duration, BackoffMode, OnError, OutputParse, ParseKind,
    RoutingStrategy, Settings, Step, VarDef, WaitPolicy, Workflow,
};
pub use parser::{load_workflow, read_workflow};
pub use validator::{validate_workflow, ValidationError, ValidationReport};
