//! Run Monitoring Module
//!
//! Post-run reporting over a finished [`ExecutionState`](crate::execution::ExecutionState).
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{render_timeline, status_tally, ExecutionTimeline, StepSpan};
