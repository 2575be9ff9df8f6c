//! Workflow Definition Module
//!
//! Data structures shared by the whole engine, plus loading workflows from
//! YAML files.
//!
//! # Structure
//!
//! - [`model`]: Status machine and component kinds
//! - [`snapshot`]: Serializable snapshots of components
//! - [`parser`]: YAML definitions and loading
//! - [`validator`]: Structural validation of definitions

pub mod model;
pub mod parser;
pub mod snapshot;
pub mod validator;

pub use model::{ComponentKind, Status};
pub use parser::{load_workflow, parse_workflow, StepDefinition, WorkDefinition, WorkflowDefinition};
pub use snapshot::{StepSnapshot, WorkSnapshot, WorkflowSnapshot};
pub use validator::{validate_workflow, ValidationError};
