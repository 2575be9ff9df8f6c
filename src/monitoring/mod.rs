//! Monitoring Module
//!
//! Observes a running component tree through its events.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Start/end timing for reports and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
