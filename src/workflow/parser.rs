//! Workflow Parser
//!
//! Loads workflow definitions from YAML and turns them into runtime
//! component trees whose steps run shell commands.
//!
//! ```yaml
//! id: nightly
//! name: Nightly batch
//! input: 5
//! works:
//!   - id: math
//!     steps:
//!       - id: inc
//!         command: echo $(( {input} + 1 ))
//!       - id: double
//!         command: echo $(( {input} * 2 ))
//!   - id: report
//!     steps:
//!       - id: greet
//!         command: echo "got {input}"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::validator::validate_workflow;
use crate::error::{Error, Result};
use crate::execution::command::ShellCommand;
use crate::execution::{Step, Work, Workflow};
use crate::storage::Storage;

/// A step as written in a workflow file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Bash command; `{input}` is replaced by the step input
    #[serde(default)]
    pub command: String,
}

/// A sequential chain of steps as written in a workflow file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// A complete workflow file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Default input when none is given on the command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Directory the step commands run in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub works: Vec<WorkDefinition>,
}

impl StepDefinition {
    fn build(&self, working_dir: Option<&Path>) -> Step {
        let mut command = ShellCommand::new(self.command.clone());
        if let Some(dir) = working_dir {
            command = command.with_working_dir(dir);
        }

        let mut step = command.into_step(self.id.clone());
        if let Some(name) = &self.name {
            step = step.with_name(name.clone());
        }
        if let Some(description) = &self.description {
            step = step.with_description(description.clone());
        }
        step
    }
}

impl WorkDefinition {
    fn build(&self, working_dir: Option<&Path>) -> Work {
        let mut work = Work::new(self.id.clone());
        if let Some(name) = &self.name {
            work = work.with_name(name.clone());
        }
        if let Some(description) = &self.description {
            work = work.with_description(description.clone());
        }
        for step in &self.steps {
            work.add(step.build(working_dir));
        }
        work
    }
}

impl WorkflowDefinition {
    /// Total number of steps across all works.
    pub fn step_count(&self) -> usize {
        self.works.iter().map(|w| w.steps.len()).sum()
    }

    /// Builds the runtime tree.
    ///
    /// With `storage`, the whole tree persists its state and resumes from
    /// it on the first `start`.
    pub fn build(&self, storage: Option<Arc<dyn Storage>>) -> Workflow {
        let mut workflow = Workflow::new(self.id.clone());
        if let Some(name) = &self.name {
            workflow = workflow.with_name(name.clone());
        }
        if let Some(description) = &self.description {
            workflow = workflow.with_description(description.clone());
        }
        if let Some(storage) = storage {
            workflow = workflow.with_storage(storage);
        }

        let working_dir = self.working_dir.as_deref();
        for work in &self.works {
            workflow.add(work.build(working_dir));
        }

        debug!(
            "Built workflow '{}': {} works, {} steps",
            self.id,
            self.works.len(),
            self.step_count()
        );
        workflow
    }
}

/// Parses and validates a workflow definition from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition> {
    let workflow: WorkflowDefinition = serde_yaml::from_str(yaml)?;

    info!(
        "Parsed workflow '{}': {} works, {} steps",
        workflow.id,
        workflow.works.len(),
        workflow.step_count()
    );

    validate_workflow(&workflow).map_err(Error::InvalidDefinition)?;
    Ok(workflow)
}

/// Loads a workflow definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} works", definition.works.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidDefinition(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workflow(&yaml_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::workflow::model::Status;
    use serde_json::json;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
id: nightly
name: Nightly batch
input: 5
works:
  - id: math
    steps:
      - id: inc
        command: echo $(( {input} + 1 ))
      - id: double
        name: Double it
        command: echo $(( {input} * 2 ))
  - id: report
    description: says hello
    steps:
      - id: greet
        command: echo "got {input}"
"#;

    #[test]
    fn test_parse_workflow() {
        let definition = parse_workflow(SAMPLE).unwrap();

        assert_eq!(definition.id, "nightly");
        assert_eq!(definition.name.as_deref(), Some("Nightly batch"));
        assert_eq!(definition.input, Some(json!(5)));
        assert_eq!(definition.works.len(), 2);
        assert_eq!(definition.step_count(), 3);
        assert_eq!(definition.works[0].steps[1].name.as_deref(), Some("Double it"));
        assert_eq!(definition.works[1].description.as_deref(), Some("says hello"));
    }

    #[test]
    fn test_parse_structured_input() {
        let yaml = r#"
id: wf
input:
  date: "2024-01-01"
  files: [a, b]
works:
  - id: w
    steps: []
"#;
        let definition = parse_workflow(yaml).unwrap();
        assert_eq!(
            definition.input,
            Some(json!({"date": "2024-01-01", "files": ["a", "b"]}))
        );
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse_workflow("id: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_parse_rejects_invalid_definition() {
        let yaml = r#"
id: wf
works:
  - id: w
    steps:
      - id: s
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(ref m) if m.contains("Step 's' has no command")));
    }

    #[test]
    fn test_load_workflow_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("workflow.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let definition = load_workflow(&path).unwrap();
        assert_eq!(definition.id, "nightly");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow("/nonexistent/workflow.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read workflow file"));
    }

    #[test]
    fn test_build_tree_shape() {
        let definition = parse_workflow(SAMPLE).unwrap();
        let workflow = definition.build(None);

        let snapshot = workflow.snapshot();
        assert_eq!(snapshot.id, "nightly");
        assert_eq!(snapshot.name.as_deref(), Some("Nightly batch"));
        assert_eq!(snapshot.works.len(), 2);
        assert_eq!(snapshot.works[0].steps.len(), 2);
        assert_eq!(snapshot.works[0].steps[1].name.as_deref(), Some("Double it"));
        assert!(snapshot.works.iter().all(|w| w.status == Status::Pending));
    }

    #[tokio::test]
    async fn test_built_workflow_runs() {
        let definition = parse_workflow(SAMPLE).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let workflow = definition.build(Some(storage.clone()));

        let snapshot = workflow.run(definition.input.clone().unwrap()).await.unwrap();
        assert_eq!(snapshot.status, Status::Success);
        assert_eq!(snapshot.work("math").unwrap().output, Some(json!(12)));
        assert_eq!(snapshot.work("report").unwrap().output, Some(json!("got 5")));
        assert!(storage.get("workflow:nightly").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_working_dir_applies_to_steps() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("value.txt"), "7").unwrap();

        let mut definition = parse_workflow(
            r#"
id: wf
works:
  - id: w
    steps:
      - id: read
        command: cat value.txt
"#,
        )
        .unwrap();
        definition.working_dir = Some(temp_dir.path().to_path_buf());

        let snapshot = definition.build(None).run(Value::Null).await.unwrap();
        assert_eq!(snapshot.work("w").unwrap().output, Some(json!(7)));
    }
}
