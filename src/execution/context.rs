//! Execution Context
//!
//! What a component receives from whoever started it, and what a step's
//! `run` function receives in turn.

use std::fmt;

use tokio_util::sync::CancellationToken;

use super::engine::Workflow;
use super::work::Work;

/// Handles to the enclosing components of an execution.
///
/// A context only lives for the duration of one `start` call; it is never
/// stored on a child, so it introduces no ownership cycles.
#[derive(Clone, Default)]
pub struct Context {
    pub workflow: Option<Workflow>,
    pub work: Option<Work>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_work(mut self, work: Work) -> Self {
        self.work = Some(work);
        self
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow.as_ref().map(|w| w.id())
    }

    pub fn work_id(&self) -> Option<&str> {
        self.work.as_ref().map(|w| w.id())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("workflow", &self.workflow_id())
            .field("work", &self.work_id())
            .finish()
    }
}

/// Context handed to a step's `run` function.
///
/// Stopping a step does not abort its `run` future; the engine just stops
/// waiting for it. Long-running functions that want to end early can watch
/// [`stopped`](Self::stopped) or poll [`is_stopped`](Self::is_stopped).
#[derive(Clone)]
pub struct StepContext {
    step_id: String,
    parent: Context,
    cancellation: CancellationToken,
}

impl StepContext {
    pub(crate) fn new(step_id: impl Into<String>, parent: Context, cancellation: CancellationToken) -> Self {
        Self {
            step_id: step_id.into(),
            parent,
            cancellation,
        }
    }

    /// Id of the step being run.
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The work running this step, if any.
    pub fn work(&self) -> Option<&Work> {
        self.parent.work.as_ref()
    }

    /// The workflow running this step's work, if any.
    pub fn workflow(&self) -> Option<&Workflow> {
        self.parent.workflow.as_ref()
    }

    pub fn parent(&self) -> &Context {
        &self.parent
    }

    /// True once the step has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the step is stopped.
    pub async fn stopped(&self) {
        self.cancellation.cancelled().await
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step_id", &self.step_id)
            .field("parent", &self.parent)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
