//! Workflow Execution Module
//!
//! The runtime component tree and everything it needs to run: the status
//! transitions, pause/resume synchronization and event bubbling.
//!
//! # Architecture
//!
//! - [`engine`]: [`Workflow`], runs its works concurrently
//! - [`work`]: [`Work`], runs its steps one after another
//! - [`step`]: [`Step`], wraps a user function
//! - [`gate`]: the pause gate each component waits on
//! - [`context`]: what a step's function receives
//! - [`command`]: shell-command step functions

pub mod command;
pub mod context;
pub mod engine;
pub mod gate;
pub mod step;
pub mod work;

pub use context::{Context, StepContext};
pub use engine::Workflow;
pub use gate::PauseGate;
pub use step::{RunFuture, Step};
pub use work::Work;

/// How a snapshot's status is interpreted when applied to a live component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestoreMode {
    /// Taken in this process; copied as-is.
    Exact,
    /// Read back from storage by a new process; in-flight work is re-queued.
    AfterRestart,
}
