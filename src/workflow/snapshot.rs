//! Snapshot Records
//!
//! Plain data captured from a live component tree. Snapshots are what gets
//! persisted to storage and what every event carries; they never hold
//! references back to a parent, so a tree serializes without cycles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{ComponentKind, Status};

/// Captured state of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Always [`ComponentKind::Step`]
    #[serde(rename = "type")]
    pub kind: ComponentKind,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Captured state of a work and its steps, in chain order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkSnapshot {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Always [`ComponentKind::Work`]
    #[serde(rename = "type")]
    pub kind: ComponentKind,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepSnapshot>,
}

/// Captured state of a workflow and its works, in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Always [`ComponentKind::Workflow`]
    #[serde(rename = "type")]
    pub kind: ComponentKind,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub works: Vec<WorkSnapshot>,
}

impl WorkSnapshot {
    /// Finds a step snapshot by id.
    pub fn step(&self, id: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.id == id)
    }
}

impl WorkflowSnapshot {
    /// Finds a work snapshot by id.
    pub fn work(&self, id: &str) -> Option<&WorkSnapshot> {
        self.works.iter().find(|w| w.id == id)
    }
}
