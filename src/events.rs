//! Component Events
//!
//! Every step, work and workflow owns an [`EventHub`]. Lifecycle changes are
//! published as typed [`Event`]s carrying the emitter's snapshot, and parents
//! re-publish their children's events so a subscriber on the root sees the
//! whole tree.
//!
//! Event names follow `"{level}:{lifecycle}"`, e.g. `step:start` or
//! `workflow:failed`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use serde::Serialize;

use crate::workflow::model::{ComponentKind, Status};
use crate::workflow::snapshot::{StepSnapshot, WorkSnapshot, WorkflowSnapshot};

/// The lifecycle moment an event reports.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Start,
    Success,
    Failed,
    Pause,
    Resume,
    Stop,
    /// State changed outside a status transition (restore, children added/removed)
    Change,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Start => "start",
            Lifecycle::Success => "success",
            Lifecycle::Failed => "failed",
            Lifecycle::Pause => "pause",
            Lifecycle::Resume => "resume",
            Lifecycle::Stop => "stop",
            Lifecycle::Change => "change",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Lifecycle::Start),
            "success" => Ok(Lifecycle::Success),
            "failed" => Ok(Lifecycle::Failed),
            "pause" => Ok(Lifecycle::Pause),
            "resume" => Ok(Lifecycle::Resume),
            "stop" => Ok(Lifecycle::Stop),
            "change" => Ok(Lifecycle::Change),
            other => Err(format!("Unknown lifecycle: '{}'", other)),
        }
    }
}

/// Identifies an event name such as `work:pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind {
    pub level: ComponentKind,
    pub lifecycle: Lifecycle,
}

impl EventKind {
    pub const fn new(level: ComponentKind, lifecycle: Lifecycle) -> Self {
        Self { level, lifecycle }
    }

    pub const fn step(lifecycle: Lifecycle) -> Self {
        Self::new(ComponentKind::Step, lifecycle)
    }

    pub const fn work(lifecycle: Lifecycle) -> Self {
        Self::new(ComponentKind::Work, lifecycle)
    }

    pub const fn workflow(lifecycle: Lifecycle) -> Self {
        Self::new(ComponentKind::Workflow, lifecycle)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.lifecycle)
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (level, lifecycle) = s
            .split_once(':')
            .ok_or_else(|| format!("Event name '{}' is not of the form level:lifecycle", s))?;
        Ok(Self::new(level.parse()?, lifecycle.parse()?))
    }
}

/// A lifecycle event and the emitter's snapshot at that moment.
///
/// For `failed` events the snapshot's `error` field holds the message.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum Event {
    Workflow {
        lifecycle: Lifecycle,
        snapshot: WorkflowSnapshot,
    },
    Work {
        lifecycle: Lifecycle,
        snapshot: WorkSnapshot,
    },
    Step {
        lifecycle: Lifecycle,
        snapshot: StepSnapshot,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        EventKind::new(self.level(), self.lifecycle())
    }

    pub fn level(&self) -> ComponentKind {
        match self {
            Event::Workflow { .. } => ComponentKind::Workflow,
            Event::Work { .. } => ComponentKind::Work,
            Event::Step { .. } => ComponentKind::Step,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            Event::Workflow { lifecycle, .. }
            | Event::Work { lifecycle, .. }
            | Event::Step { lifecycle, .. } => *lifecycle,
        }
    }

    /// Id of the component that emitted the event.
    pub fn id(&self) -> &str {
        match self {
            Event::Workflow { snapshot, .. } => &snapshot.id,
            Event::Work { snapshot, .. } => &snapshot.id,
            Event::Step { snapshot, .. } => &snapshot.id,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Event::Workflow { snapshot, .. } => snapshot.status,
            Event::Work { snapshot, .. } => snapshot.status,
            Event::Step { snapshot, .. } => snapshot.status,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Event::Workflow { snapshot, .. } => snapshot.error.as_deref(),
            Event::Work { snapshot, .. } => snapshot.error.as_deref(),
            Event::Step { snapshot, .. } => snapshot.error.as_deref(),
        }
    }

    /// Event name, e.g. `"step:success"`.
    pub fn name(&self) -> String {
        self.kind().to_string()
    }
}

/// Handle returned by [`EventHub::on`], used to unregister the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked for matching events.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: ListenerId,
    /// `None` matches every event
    kind: Option<EventKind>,
    listener: Listener,
}

/// Publish/subscribe registry scoped to one component.
///
/// Emission is synchronous: [`emit`](Self::emit) returns after every
/// matching listener has run, in registration order. A listener that panics
/// is logged and skipped; the remaining listeners still see the event.
///
/// No lock is held while listeners run, so a listener may read snapshots or
/// register further listeners. Listeners must not emit on the hub they are
/// registered on, or emission will recurse.
pub struct EventHub {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Registers a listener for every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().push(Registration { id, kind, listener });
        id
    }

    /// Removes a single listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() < before
    }

    /// Removes every listener registered for `kind`.
    ///
    /// Catch-all listeners from [`on_any`](Self::on_any) are left in place.
    pub fn off_kind(&self, kind: EventKind) {
        self.registrations.lock().retain(|r| r.kind != Some(kind));
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.registrations.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Delivers an event to all matching listeners.
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .registrations
            .lock()
            .iter()
            .filter(|r| r.kind.map_or(true, |k| k == kind))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("Listener for '{}' on '{}' panicked", kind, event.id());
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
