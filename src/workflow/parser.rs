//! Workflow Parser
//!
//! Handles loading workflow definitions from YAML (or JSON) files and
//! running static validation on them.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use super::validator::validate_and_log;

/// Supported workflow file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Yaml,
    Json,
}

impl WorkflowFormat {
    /// Picks a format from the file extension, defaulting to YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => WorkflowFormat::Json,
            _ => WorkflowFormat::Yaml,
        }
    }
}

/// Parses a workflow from text without validating it.
pub fn parse_workflow(content: &str, format: WorkflowFormat) -> Result<Workflow, Box<dyn Error>> {
    let workflow: Workflow = match format {
        WorkflowFormat::Yaml => serde_yaml::from_str(content).map_err(|e| {
            format!("Failed to parse workflow YAML: {}. Check the file format.", e)
        })?,
        WorkflowFormat::Json => serde_json::from_str(content).map_err(|e| {
            format!("Failed to parse workflow JSON: {}. Check the file format.", e)
        })?,
    };
    Ok(workflow)
}

/// Loads a workflow from a file.
///
/// This function:
/// 1. Reads and parses the file (YAML, or JSON for `.json` files)
/// 2. Records the file's directory for resolving `prompt_file` paths
/// 3. Validates the workflow, logging warnings
///
/// # Arguments
///
/// * `path` - Path to the workflow file
///
/// # Returns
///
/// * `Ok(Workflow)` - Successfully loaded and validated workflow
/// * `Err` - Read, parse or validation error
///
/// # Example
///
/// ```rust,no_run
/// use paneflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("review.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, Box<dyn Error>> {
    let workflow = read_workflow(path)?;
    validate_and_log(&workflow)?;
    Ok(workflow)
}

/// Reads and parses a workflow file without validating it.
pub fn read_workflow(path: impl AsRef<Path>) -> Result<Workflow, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let mut workflow = parse_workflow(&content, WorkflowFormat::from_path(path))?;
    workflow.base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);

    info!(
        "Parsed workflow '{}': {} steps ({} including parallel sub-steps)",
        workflow.name,
        workflow.len(),
        workflow.all_steps().len()
    );

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{OnError, WaitPolicy};
    use std::time::Duration;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
schema_version: "2.0"
name: review
vars:
  target:
    default: src/lib.rs
settings:
  timeout: 10m
  on_error: continue
steps:
  - id: review
    agent: claude
    prompt: "Review ${vars.target}"
  - id: fixes
    depends_on: [review]
    on_error: fail_fast
    parallel:
      - id: fix_a
        agent: codex
        prompt: "Fix part A"
      - id: fix_b
        agent: gemini
        prompt_file: prompts/fix_b.md
        wait: none
"#;

    #[test]
    fn test_load_yaml_workflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("review.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.name, "review");
        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.settings.timeout, Some(Duration::from_secs(600)));
        assert_eq!(workflow.settings.on_error, Some(OnError::Continue));
        assert_eq!(workflow.base_dir.as_deref(), Some(dir.path()));

        let fixes = workflow.get_step("fixes").unwrap();
        assert_eq!(fixes.parallel.len(), 2);
        assert_eq!(fixes.on_error, Some(OnError::FailFast));
        assert_eq!(workflow.get_step("fix_b").unwrap().wait, WaitPolicy::None);
    }

    #[test]
    fn test_load_json_workflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flow.json");
        fs::write(
            &path,
            r#"{"name": "j", "steps": [{"id": "only", "prompt": "hello", "timeout": "30s"}]}"#,
        )
        .unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.steps[0].timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow("/nonexistent/flow.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read workflow file"));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "steps: [unclosed").unwrap();

        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse workflow YAML"));
    }

    #[test]
    fn test_load_rejects_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycle.yaml");
        fs::write(
            &path,
            "name: c\nsteps:\n  - id: a\n    prompt: x\n    depends_on: [b]\n  - id: b\n    prompt: y\n    depends_on: [a]\n",
        )
        .unwrap();

        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("cyclic"));

        // Reading without validation still works
        assert_eq!(read_workflow(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(WorkflowFormat::from_path(Path::new("a.JSON")), WorkflowFormat::Json);
        assert_eq!(WorkflowFormat::from_path(Path::new("a.yml")), WorkflowFormat::Yaml);
        assert_eq!(WorkflowFormat::from_path(Path::new("noext")), WorkflowFormat::Yaml);
    }
}
