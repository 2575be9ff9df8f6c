//! Workflow Validation
//!
//! Structural checks on a parsed [`WorkflowDefinition`] before it is turned
//! into a runtime tree:
//! - The workflow has an id and at least one work
//! - Every work and step has a non-empty id
//! - Work ids are unique within the workflow
//! - Step ids are unique across the whole workflow
//! - Every step has a command
//!
//! Step ids must be unique across works, not just within one, because
//! persisted state is keyed by `step:{id}`.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::parser::{StepDefinition, WorkflowDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflowId,
    EmptyWorkflow,
    EmptyWorkId,
    DuplicateWorkId(String),
    EmptyStepId { work: String },
    DuplicateStepId(String),
    EmptyCommand(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowId => write!(f, "Workflow has empty or whitespace-only ID"),
            Self::EmptyWorkflow => write!(f, "Workflow has no works"),
            Self::EmptyWorkId => write!(f, "Work has empty or whitespace-only ID"),
            Self::DuplicateWorkId(id) => write!(f, "Duplicate work ID: '{}'", id),
            Self::EmptyStepId { work } => {
                write!(f, "Work '{}' has a step with empty or whitespace-only ID", work)
            }
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyCommand(step) => write!(f, "Step '{}' has no command specified", step),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &StepDefinition, work_id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId {
            work: work_id.to_string(),
        });
        return errors; // Can't name the remaining problems without an ID
    }

    if step.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(step.id.clone()));
    }

    errors
}

/// Collects every structural problem in a definition.
///
/// Returns an empty list for a valid workflow.
pub fn find_problems(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }
    if workflow.works.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
        return errors;
    }

    let mut work_ids: HashSet<&str> = HashSet::new();
    let mut step_ids: HashSet<&str> = HashSet::new();

    for work in &workflow.works {
        let work_id = work.id.trim();
        if work_id.is_empty() {
            errors.push(ValidationError::EmptyWorkId);
        } else if !work_ids.insert(work_id) {
            errors.push(ValidationError::DuplicateWorkId(work_id.to_string()));
        }

        if work.steps.is_empty() {
            warn!("Work '{}' has no steps - its input passes straight through", work_id);
        }

        for step in &work.steps {
            errors.extend(validate_step(step, work_id));

            let step_id = step.id.trim();
            if !step_id.is_empty() && !step_ids.insert(step_id) {
                errors.push(ValidationError::DuplicateStepId(step_id.to_string()));
            }
        }

        debug!("Work '{}': {} steps checked", work_id, work.steps.len());
    }

    errors
}

/// Validates the entire workflow definition.
///
/// All problems are reported together, one per line.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), String> {
    info!("Validating workflow with {} works", workflow.works.len());

    let errors = find_problems(workflow);
    if !errors.is_empty() {
        let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(error_messages.join("\n"));
    }

    info!(
        "Workflow validated: {} works, {} steps",
        workflow.works.len(),
        workflow.step_count()
    );
    Ok(())
}
