//! Workflow Data Model
//!
//! The status machine shared by steps, works and workflows, and the tag
//! that tells the three levels apart in snapshots, events and storage keys.
//!
//! ```text
//! PENDING ──start──▶ RUNNING ──▶ SUCCESS | FAILED
//!                     │   ▲
//!                pause│   │resume
//!                     ▼   │
//!                     PAUSED
//!
//! RUNNING | PAUSED ──stop──▶ STOPPED
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a step, work or workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Constructed, never started
    #[default]
    Pending,
    /// Executing
    Running,
    /// Suspended; will not settle until resumed or stopped
    Paused,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failed,
    /// Stopped by the caller before settling
    Stopped,
}

impl Status {
    /// Returns the lowercase name used in snapshots and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
        }
    }

    /// True for SUCCESS, FAILED and STOPPED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Stopped)
    }

    /// True for RUNNING and PAUSED, the states `stop` acts on.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Running | Status::Paused)
    }

    /// Whether `start` may begin an execution from this status.
    pub fn can_start(&self) -> bool {
        *self == Status::Pending
    }

    /// Whether `pause` applies.
    pub fn can_pause(&self) -> bool {
        *self == Status::Running
    }

    /// Whether `resume` applies.
    pub fn can_resume(&self) -> bool {
        *self == Status::Paused
    }

    /// Whether `stop` applies.
    pub fn can_stop(&self) -> bool {
        self.is_active()
    }

    /// Maps a persisted status onto what a fresh process can act on.
    ///
    /// An execution that was running or paused when its snapshot was written
    /// cannot be continued by another instance, so it becomes pending again.
    pub fn after_restart(self) -> Status {
        if self.is_active() {
            Status::Pending
        } else {
            self
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            "stopped" => Ok(Status::Stopped),
            other => Err(format!("Unknown status: '{}'", other)),
        }
    }
}

/// The three levels of the component tree.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Workflow,
    Work,
    Step,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Workflow => "workflow",
            ComponentKind::Work => "work",
            ComponentKind::Step => "step",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(ComponentKind::Workflow),
            "work" => Ok(ComponentKind::Work),
            "step" => Ok(ComponentKind::Step),
            other => Err(format!("Unknown component type: '{}'", other)),
        }
    }
}
