//! FlowRunner - Hierarchical Workflow Engine
//!
//! Runs trees of asynchronous tasks: a [`Workflow`] runs its [`Work`]s in
//! parallel, each work runs its [`Step`]s one after another. Every level
//! shares the same status machine, can be paused, resumed and stopped, and
//! publishes lifecycle events that bubble up to the root.
//!
//! Any component can be captured as a serializable snapshot. With a
//! [`Storage`] attached, snapshots are persisted on every transition and an
//! interrupted run picks up where it left off.
//!
//! # Architecture
//!
//! - [`workflow`]: Status model, snapshots and YAML definitions
//! - [`execution`]: Runtime steps, works and workflows
//! - [`events`]: Typed lifecycle events and the listener registry
//! - [`storage`]: Snapshot persistence backends
//! - [`monitoring`]: Execution timeline fed from events
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::{Step, Work, Workflow};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let math = Work::new("math");
//!     math.add(Step::from_fn("inc", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1))))
//!         .add(Step::from_fn("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2))));
//!
//!     let workflow = Workflow::new("example");
//!     workflow.add(math);
//!     workflow.on_any(|event| println!("{}", event.name()));
//!
//!     let snapshot = workflow.run(json!(5)).await?;
//!     assert_eq!(snapshot.works[0].output, Some(json!(12)));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod execution;
pub mod monitoring;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use error::{Error, Result, RunError};
pub use events::{Event, EventHub, EventKind, Lifecycle, ListenerId};
pub use execution::{Context, Step, StepContext, Work, Workflow};
pub use monitoring::ExecutionTimeline;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use workflow::model::{ComponentKind, Status};
pub use workflow::parser::{load_workflow, WorkflowDefinition};
pub use workflow::snapshot::{StepSnapshot, WorkSnapshot, WorkflowSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
