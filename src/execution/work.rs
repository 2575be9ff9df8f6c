//! Runtime Work
//!
//! An ordered chain of steps run one after another, each step receiving the
//! previous step's output. A work re-publishes every event of its steps and
//! folds them into its own status: a step pausing pauses the work, a step
//! failing fails it.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::context::Context;
use super::gate::PauseGate;
use super::step::Step;
use super::RestoreMode;
use crate::error::{Error, Result};
use crate::events::{Event, EventHub, EventKind, Lifecycle, ListenerId};
use crate::storage::{storage_key, Storage};
use crate::workflow::model::{ComponentKind, Status};
use crate::workflow::snapshot::WorkSnapshot;

/// A step together with the listener forwarding its events to the work.
struct Attached {
    step: Step,
    listener: ListenerId,
}

#[derive(Default)]
struct WorkState {
    name: Option<String>,
    description: Option<String>,
    status: Status,
    input: Option<Value>,
    output: Option<Value>,
    error: Option<String>,
    steps: Vec<Attached>,
}

pub(crate) struct WorkInner {
    id: String,
    state: Mutex<WorkState>,
    gate: PauseGate,
    hub: EventHub,
    storage: RwLock<Option<Arc<dyn Storage>>>,
    restored: OnceCell<()>,
}

/// A sequential chain of steps.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::{Step, Work};
/// use serde_json::json;
///
/// # async fn demo() -> flowrunner::Result<()> {
/// let work = Work::new("math");
/// work.add(Step::from_fn("inc", |x| Ok(json!(x.as_i64().unwrap_or(0) + 1))));
/// work.add(Step::from_fn("double", |x| Ok(json!(x.as_i64().unwrap_or(0) * 2))));
///
/// let snapshot = work.run(json!(5)).await?;
/// assert_eq!(snapshot.output, Some(json!(12)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl Work {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                id: id.into().trim().to_string(),
                state: Mutex::new(WorkState::default()),
                gate: PauseGate::new(),
                hub: EventHub::new(),
                storage: RwLock::new(None),
                restored: OnceCell::new(),
            }),
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.inner.state.lock().name = Some(name.into());
        self
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.inner.state.lock().description = Some(description.into());
        self
    }

    /// Persists this work, and any step added without its own storage.
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        for step in self.steps() {
            step.inherit_storage(&storage);
        }
        *self.inner.storage.write() = Some(storage);
        self
    }

    pub(crate) fn inherit_storage(&self, storage: &Arc<dyn Storage>) {
        {
            let mut slot = self.inner.storage.write();
            if slot.is_some() {
                return;
            }
            *slot = Some(Arc::clone(storage));
        }
        for step in self.steps() {
            step.inherit_storage(storage);
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    pub fn output(&self) -> Option<Value> {
        self.inner.state.lock().output.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn storage_key(&self) -> String {
        storage_key(ComponentKind::Work, &self.inner.id)
    }

    /// Appends a step to the chain.
    ///
    /// A step with the same id as an existing one replaces it in place. The
    /// step's events are re-published on this work from now on, and the step
    /// inherits the work's storage if it has none.
    pub fn add(&self, step: Step) -> &Self {
        if let Some(storage) = self.storage() {
            step.inherit_storage(&storage);
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = step.on_any(move |event| {
            if let Some(work) = Work::upgrade(&weak) {
                work.on_step_event(event);
            }
        });

        let replaced = {
            let mut state = self.inner.state.lock();
            let attached = Attached { step, listener };
            match state.steps.iter().position(|a| a.step.id() == attached.step.id()) {
                Some(index) => Some(std::mem::replace(&mut state.steps[index], attached)),
                None => {
                    state.steps.push(attached);
                    None
                }
            }
        };

        if let Some(old) = replaced {
            debug!("Work '{}': replaced step '{}'", self.inner.id, old.step.id());
            old.step.off(old.listener);
        }

        self.emit(Lifecycle::Change, self.snapshot());
        self
    }

    /// Detaches a step and stops forwarding its events.
    pub fn remove(&self, id: &str) -> Option<Step> {
        let removed = {
            let mut state = self.inner.state.lock();
            let index = state.steps.iter().position(|a| a.step.id() == id)?;
            state.steps.remove(index)
        };

        removed.step.off(removed.listener);
        self.emit(Lifecycle::Change, self.snapshot());
        Some(removed.step)
    }

    /// Steps in chain order.
    pub fn steps(&self) -> Vec<Step> {
        self.inner.state.lock().steps.iter().map(|a| a.step.clone()).collect()
    }

    pub fn step(&self, id: &str) -> Option<Step> {
        self.inner
            .state
            .lock()
            .steps
            .iter()
            .find(|a| a.step.id() == id)
            .map(|a| a.step.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().steps.is_empty()
    }

    /// The work's event hub; carries `work:*` and forwarded `step:*` events.
    pub fn events(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.hub.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.hub.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.hub.off(id)
    }

    /// Captures the work and its steps.
    pub fn snapshot(&self) -> WorkSnapshot {
        let state = self.inner.state.lock();
        self.capture(&state)
    }

    fn capture(&self, state: &WorkState) -> WorkSnapshot {
        WorkSnapshot {
            id: self.inner.id.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            kind: ComponentKind::Work,
            status: state.status,
            input: state.input.clone(),
            output: state.output.clone(),
            error: state.error.clone(),
            steps: state.steps.iter().map(|a| a.step.snapshot()).collect(),
        }
    }

    pub async fn run(&self, input: Value) -> Result<WorkSnapshot> {
        self.start(input, Context::new()).await
    }

    /// Runs the steps in insertion order, threading each output into the
    /// next step's input.
    ///
    /// With no steps the input passes through as the output. The first
    /// failing step fails the work and later steps never start. Like a step,
    /// a work only executes from PENDING; otherwise its snapshot is returned.
    pub async fn start(&self, input: Value, ctx: Context) -> Result<WorkSnapshot> {
        self.ensure_restored().await;

        let snapshot = {
            let mut state = self.inner.state.lock();
            if !state.status.can_start() {
                debug!("Work '{}' is {} - not starting again", self.inner.id, state.status);
                return Ok(self.capture(&state));
            }
            state.status = Status::Running;
            state.input = Some(input.clone());
            state.output = None;
            state.error = None;
            self.capture(&state)
        };

        info!("Starting work: {} ({} steps)", self.inner.id, snapshot.steps.len());
        self.persist(&snapshot).await;
        self.emit(Lifecycle::Start, snapshot);

        let ctx = ctx.with_work(self.clone());
        let mut current = input;

        for step in self.steps() {
            if !self.wait_while_paused().await {
                return Ok(self.snapshot());
            }

            let settled = match step.start(current.clone(), ctx.clone()).await {
                Ok(settled) => settled,
                Err(e) => return Err(self.fail(e).await),
            };

            match settled.status {
                Status::Success => current = settled.output.unwrap_or(Value::Null),
                Status::Stopped => {
                    debug!("Work '{}': step '{}' was stopped", self.inner.id, step.id());
                    return Ok(self.halt().await);
                }
                Status::Failed => {
                    let cause = Error::StepFailed {
                        step: settled.id,
                        message: settled.error.unwrap_or_default(),
                    };
                    return Err(self.fail(cause).await);
                }
                status => {
                    let cause = Error::Incomplete {
                        kind: ComponentKind::Step,
                        id: settled.id,
                        status,
                    };
                    return Err(self.fail(cause).await);
                }
            }
        }

        if !self.wait_while_paused().await {
            return Ok(self.snapshot());
        }

        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.status != Status::Running {
                return Ok(self.capture(&state));
            }
            state.status = Status::Success;
            state.output = Some(current);
            self.capture(&state)
        };

        info!("Work '{}' completed successfully", self.inner.id);
        self.persist(&snapshot).await;
        self.emit(Lifecycle::Success, snapshot.clone());
        Ok(snapshot)
    }

    async fn wait_while_paused(&self) -> bool {
        loop {
            self.inner.gate.wait().await;
            match self.status() {
                Status::Running => return true,
                Status::Paused => continue,
                _ => return false,
            }
        }
    }

    /// Marks the work FAILED (unless a folded `step:failed` already did) and
    /// wraps the cause.
    async fn fail(&self, cause: Error) -> Error {
        let message = cause.root_message();
        let snapshot = {
            let mut state = self.inner.state.lock();
            match state.status {
                Status::Pending | Status::Running | Status::Paused => {
                    state.status = Status::Failed;
                    state.error = Some(message.clone());
                    self.inner.gate.open();
                    Some(self.capture(&state))
                }
                _ => None,
            }
        };

        // A folded child failure may already have settled this level
        if let Some(snapshot) = snapshot {
            error!("Work '{}' failed: {}", self.inner.id, message);
            self.emit(Lifecycle::Failed, snapshot);
        }
        self.persist(&self.snapshot()).await;

        Error::WorkFailed {
            work: self.inner.id.clone(),
            source: Box::new(cause),
        }
    }

    /// Settles the work to STOPPED after one of its steps was stopped.
    async fn halt(&self) -> WorkSnapshot {
        if let Some(snapshot) = self.promote(Status::is_active, Status::Stopped, Lifecycle::Stop, None) {
            self.persist(&snapshot).await;
        }
        self.snapshot()
    }

    /// Pauses every step, then the work. No-op unless RUNNING.
    pub async fn pause(&self) -> WorkSnapshot {
        self.ensure_restored().await;
        if !self.status().can_pause() {
            return self.snapshot();
        }

        join_all(self.steps().iter().map(|s| s.pause())).await;
        self.promote(Status::can_pause, Status::Paused, Lifecycle::Pause, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    /// Resumes every step, then the work. No-op unless PAUSED.
    pub async fn resume(&self) -> WorkSnapshot {
        self.ensure_restored().await;
        if !self.status().can_resume() {
            return self.snapshot();
        }

        join_all(self.steps().iter().map(|s| s.resume())).await;
        self.promote(Status::can_resume, Status::Running, Lifecycle::Resume, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    /// Stops every step, then the work. No-op unless RUNNING or PAUSED.
    pub async fn stop(&self) -> WorkSnapshot {
        if !self.status().can_stop() {
            return self.snapshot();
        }

        join_all(self.steps().iter().map(|s| s.stop())).await;
        self.promote(Status::can_stop, Status::Stopped, Lifecycle::Stop, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    /// Moves to `to` if the current status passes `allowed`, then emits.
    ///
    /// Shared by the public operations and by event folding, so whichever
    /// runs first performs the transition and the other is a no-op.
    fn promote(
        &self,
        allowed: fn(&Status) -> bool,
        to: Status,
        lifecycle: Lifecycle,
        error: Option<String>,
    ) -> Option<WorkSnapshot> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if !allowed(&state.status) {
                return None;
            }
            state.status = to;
            if error.is_some() {
                state.error = error;
            }
            if to == Status::Paused {
                self.inner.gate.close();
            } else {
                self.inner.gate.open();
            }
            self.capture(&state)
        };

        debug!("Work '{}' -> {}", self.inner.id, to);
        self.emit(lifecycle, snapshot.clone());
        Some(snapshot)
    }

    /// Re-publishes a step event and folds it into the work's status.
    fn on_step_event(&self, event: &Event) {
        self.inner.hub.emit(event);

        if event.level() != ComponentKind::Step {
            return;
        }
        match event.lifecycle() {
            Lifecycle::Start => {
                self.promote(Status::can_start, Status::Running, Lifecycle::Start, None);
            }
            Lifecycle::Pause => {
                self.promote(Status::can_pause, Status::Paused, Lifecycle::Pause, None);
            }
            Lifecycle::Resume => {
                self.promote(Status::can_resume, Status::Running, Lifecycle::Resume, None);
            }
            Lifecycle::Failed => {
                let error = event.error().map(str::to_string);
                self.promote(
                    |s| !s.is_terminal(),
                    Status::Failed,
                    Lifecycle::Failed,
                    error,
                );
            }
            _ => {}
        }
    }

    fn upgrade(weak: &Weak<WorkInner>) -> Option<Work> {
        weak.upgrade().map(|inner| Work { inner })
    }

    /// Replaces the work's state, and its steps', with an in-process snapshot.
    ///
    /// Step snapshots are matched by id; ones without a matching step are
    /// skipped. Emits `work:change`.
    pub fn restore(&self, snapshot: &WorkSnapshot) -> Result<()> {
        self.check_id(snapshot)?;
        self.apply(snapshot, RestoreMode::Exact);
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(())
    }

    /// Loads the persisted snapshot, if any, treating a RUNNING or PAUSED
    /// work (and steps) as interrupted.
    ///
    /// Steps that already succeeded keep their output and are skipped by the
    /// next `start`. Runs automatically before the first `start`, `pause` or
    /// `resume`.
    pub async fn auto_restore(&self) -> Result<bool> {
        let _ = self.inner.restored.set(());
        self.load_persisted().await
    }

    async fn ensure_restored(&self) {
        self.inner
            .restored
            .get_or_init(|| async {
                if let Err(e) = self.load_persisted().await {
                    warn!("Could not restore work '{}': {}", self.inner.id, e);
                }
            })
            .await;
    }

    async fn load_persisted(&self) -> Result<bool> {
        let Some(storage) = self.storage() else {
            return Ok(false);
        };
        let Some(value) = storage.get(&self.storage_key()).await? else {
            return Ok(false);
        };

        let snapshot: WorkSnapshot = serde_json::from_value(value)?;
        self.check_id(&snapshot)?;
        self.apply(&snapshot, RestoreMode::AfterRestart);
        info!("Restored work '{}' ({})", self.inner.id, self.status());
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(true)
    }

    fn check_id(&self, snapshot: &WorkSnapshot) -> Result<()> {
        if snapshot.id != self.inner.id {
            return Err(Error::SnapshotMismatch {
                kind: ComponentKind::Work,
                expected: self.inner.id.clone(),
                found: snapshot.id.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn apply(&self, snapshot: &WorkSnapshot, mode: RestoreMode) {
        let status = match mode {
            RestoreMode::Exact => {
                let _ = self.inner.restored.set(());
                snapshot.status
            }
            RestoreMode::AfterRestart => snapshot.status.after_restart(),
        };

        {
            let mut state = self.inner.state.lock();
            state.status = status;
            state.input = snapshot.input.clone();
            state.output = snapshot.output.clone();
            state.error = snapshot.error.clone();
            if status == Status::Paused {
                self.inner.gate.close();
            } else {
                self.inner.gate.open();
            }
        }

        for step_snapshot in &snapshot.steps {
            match self.step(&step_snapshot.id) {
                Some(step) => step.apply(step_snapshot, mode),
                None => warn!(
                    "Work '{}': snapshot has unknown step '{}' - skipping",
                    self.inner.id, step_snapshot.id
                ),
            }
        }
    }

    fn storage(&self) -> Option<Arc<dyn Storage>> {
        self.inner.storage.read().clone()
    }

    /// Writes the current snapshot to storage.
    pub async fn save(&self) -> Result<()> {
        if let Some(storage) = self.storage() {
            let value = serde_json::to_value(self.snapshot())?;
            storage.set(&self.storage_key(), value).await?;
        }
        Ok(())
    }

    /// Deletes the persisted snapshots of this work and its steps.
    pub async fn purge(&self) -> Result<()> {
        for step in self.steps() {
            step.purge().await?;
        }
        if let Some(storage) = self.storage() {
            storage.delete(&self.storage_key()).await?;
        }
        Ok(())
    }

    async fn persist(&self, snapshot: &WorkSnapshot) {
        let Some(storage) = self.storage() else {
            return;
        };
        let result = match serde_json::to_value(snapshot) {
            Ok(value) => storage.set(&self.storage_key(), value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist work '{}': {}", self.inner.id, e);
        }
    }

    fn emit(&self, lifecycle: Lifecycle, snapshot: WorkSnapshot) {
        self.inner.hub.emit(&Event::Work { lifecycle, snapshot });
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("steps", &self.len())
            .finish()
    }
}
