//! Workflow Execution Engine
//!
//! The root of a component tree. A [`Workflow`] hands the same input to each
//! of its works and runs them concurrently, one tokio task per work:
//! - every work starts at once; completion order is not defined
//! - the output lists the works' snapshots in insertion order
//! - the first failing work fails the workflow; siblings keep running
//! - work and step events are re-published on the workflow's hub
//!
//! With storage attached, every transition is persisted under
//! `workflow:{id}` and the whole tree resumes from its stored state the next
//! time it is started in a new process.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::{join_all, try_join_all};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::context::Context;
use super::gate::PauseGate;
use super::work::Work;
use super::RestoreMode;
use crate::error::{Error, Result};
use crate::events::{Event, EventHub, EventKind, Lifecycle, ListenerId};
use crate::storage::{storage_key, Storage};
use crate::workflow::model::{ComponentKind, Status};
use crate::workflow::snapshot::{WorkSnapshot, WorkflowSnapshot};

struct Attached {
    work: Work,
    listener: ListenerId,
}

#[derive(Default)]
struct WorkflowState {
    name: Option<String>,
    description: Option<String>,
    status: Status,
    input: Option<Value>,
    output: Option<Value>,
    error: Option<String>,
    works: Vec<Attached>,
}

pub(crate) struct WorkflowInner {
    id: String,
    state: Mutex<WorkflowState>,
    gate: PauseGate,
    hub: EventHub,
    storage: RwLock<Option<Arc<dyn Storage>>>,
    restored: OnceCell<()>,
}

/// A set of works run in parallel on the same input.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::{MemoryStorage, Step, Work, Workflow};
/// use serde_json::json;
///
/// # async fn demo() -> flowrunner::Result<()> {
/// let storage = Arc::new(MemoryStorage::new());
/// let workflow = Workflow::new("nightly").with_storage(storage);
///
/// let extract = Work::new("extract");
/// extract.add(Step::from_fn("read", |x| Ok(x)));
/// workflow.add(extract);
///
/// workflow.on_any(|event| println!("{}", event.name()));
/// let snapshot = workflow.run(json!({"date": "2024-01-01"})).await?;
/// println!("{}", serde_json::to_string_pretty(&snapshot)?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkflowInner {
                id: id.into().trim().to_string(),
                state: Mutex::new(WorkflowState::default()),
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

    /// Persists the workflow and hands the storage down to every work and
    /// step that has none of its own.
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        for work in self.works() {
            work.inherit_storage(&storage);
        }
        *self.inner.storage.write() = Some(storage);
        self
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
        storage_key(ComponentKind::Workflow, &self.inner.id)
    }

    /// Adds a work, replacing any work with the same id in place.
    ///
    /// Events of the work and its steps are re-published on the workflow.
    pub fn add(&self, work: Work) -> &Self {
        if let Some(storage) = self.storage() {
            work.inherit_storage(&storage);
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = work.on_any(move |event| {
            if let Some(workflow) = Workflow::upgrade(&weak) {
                workflow.on_work_event(event);
            }
        });

        let replaced = {
            let mut state = self.inner.state.lock();
            let attached = Attached { work, listener };
            match state.works.iter().position(|a| a.work.id() == attached.work.id()) {
                Some(index) => Some(std::mem::replace(&mut state.works[index], attached)),
                None => {
                    state.works.push(attached);
                    None
                }
            }
        };

        if let Some(old) = replaced {
            debug!("Workflow '{}': replaced work '{}'", self.inner.id, old.work.id());
            old.work.off(old.listener);
        }

        self.emit(Lifecycle::Change, self.snapshot());
        self
    }

    /// Detaches a work and stops forwarding its events.
    pub fn remove(&self, id: &str) -> Option<Work> {
        let removed = {
            let mut state = self.inner.state.lock();
            let index = state.works.iter().position(|a| a.work.id() == id)?;
            state.works.remove(index)
        };

        removed.work.off(removed.listener);
        self.emit(Lifecycle::Change, self.snapshot());
        Some(removed.work)
    }

    /// Works in insertion order.
    pub fn works(&self) -> Vec<Work> {
        self.inner.state.lock().works.iter().map(|a| a.work.clone()).collect()
    }

    pub fn work(&self, id: &str) -> Option<Work> {
        self.inner
            .state
            .lock()
            .works
            .iter()
            .find(|a| a.work.id() == id)
            .map(|a| a.work.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().works.is_empty()
    }

    /// The workflow's event hub; carries events from the whole tree.
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

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.inner.state.lock();
        self.capture(&state)
    }

    fn capture(&self, state: &WorkflowState) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.inner.id.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            kind: ComponentKind::Workflow,
            status: state.status,
            input: state.input.clone(),
            output: state.output.clone(),
            error: state.error.clone(),
            works: state.works.iter().map(|a| a.work.snapshot()).collect(),
        }
    }

    pub async fn run(&self, input: Value) -> Result<WorkflowSnapshot> {
        self.start(input, Context::new()).await
    }

    /// Runs every work concurrently on a clone of `input`.
    ///
    /// On success the output is a JSON array of the works' snapshots in
    /// insertion order. The first work to fail fails the workflow with
    /// [`Error::WorkflowFailed`]; works still in flight are not cancelled and
    /// settle on their own. Idempotent like [`Work::start`].
    pub async fn start(&self, input: Value, ctx: Context) -> Result<WorkflowSnapshot> {
        self.ensure_restored().await;

        let snapshot = {
            let mut state = self.inner.state.lock();
            if !state.status.can_start() {
                debug!("Workflow '{}' is {} - not starting again", self.inner.id, state.status);
                return Ok(self.capture(&state));
            }
            state.status = Status::Running;
            state.input = Some(input.clone());
            state.output = None;
            state.error = None;
            self.capture(&state)
        };

        info!(
            "Starting workflow: {} ({} works in parallel)",
            self.inner.id,
            snapshot.works.len()
        );
        self.persist(&snapshot).await;
        self.emit(Lifecycle::Start, snapshot);

        let ctx = ctx.with_workflow(self.clone());
        let tasks: Vec<_> = self
            .works()
            .into_iter()
            .map(|work| {
                let id = work.id().to_string();
                let input = input.clone();
                let ctx = ctx.clone();
                let handle = tokio::spawn(async move { work.start(input, ctx).await });
                async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(Error::Aborted {
                            work: id,
                            message: e.to_string(),
                        }),
                    }
                }
            })
            .collect();

        // Dropping the remaining handles on the first error detaches those tasks
        let settled = match try_join_all(tasks).await {
            Ok(settled) => settled,
            Err(e) => return Err(self.fail(e).await),
        };

        if !self.wait_while_paused().await {
            return Ok(self.snapshot());
        }

        if settled.iter().any(|w| w.status == Status::Stopped) {
            return Ok(self.halt().await);
        }
        if let Some(unsettled) = settled.iter().find(|w| w.status != Status::Success) {
            let cause = Error::Incomplete {
                kind: ComponentKind::Work,
                id: unsettled.id.clone(),
                status: unsettled.status,
            };
            return Err(self.fail(cause).await);
        }

        self.succeed(settled).await
    }

    async fn succeed(&self, settled: Vec<WorkSnapshot>) -> Result<WorkflowSnapshot> {
        let output = match serde_json::to_value(&settled) {
            Ok(output) => output,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.status != Status::Running {
                return Ok(self.capture(&state));
            }
            state.status = Status::Success;
            state.output = Some(output);
            self.capture(&state)
        };

        info!("Workflow '{}' completed successfully", self.inner.id);
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
            error!("Workflow '{}' failed: {}", self.inner.id, message);
            self.emit(Lifecycle::Failed, snapshot);
        }
        self.persist(&self.snapshot()).await;

        Error::WorkflowFailed {
            workflow: self.inner.id.clone(),
            source: Box::new(cause),
        }
    }

    async fn halt(&self) -> WorkflowSnapshot {
        if let Some(snapshot) = self.promote(Status::is_active, Status::Stopped, Lifecycle::Stop, None) {
            self.persist(&snapshot).await;
        }
        self.snapshot()
    }

    /// Pauses every work, then the workflow. No-op unless RUNNING.
    pub async fn pause(&self) -> WorkflowSnapshot {
        self.ensure_restored().await;
        if !self.status().can_pause() {
            return self.snapshot();
        }

        join_all(self.works().iter().map(|w| w.pause())).await;
        self.promote(Status::can_pause, Status::Paused, Lifecycle::Pause, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    /// Resumes every work, then the workflow. No-op unless PAUSED.
    pub async fn resume(&self) -> WorkflowSnapshot {
        self.ensure_restored().await;
        if !self.status().can_resume() {
            return self.snapshot();
        }

        join_all(self.works().iter().map(|w| w.resume())).await;
        self.promote(Status::can_resume, Status::Running, Lifecycle::Resume, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    /// Stops every work, then the workflow. No-op unless RUNNING or PAUSED.
    pub async fn stop(&self) -> WorkflowSnapshot {
        if !self.status().can_stop() {
            return self.snapshot();
        }

        join_all(self.works().iter().map(|w| w.stop())).await;
        self.promote(Status::can_stop, Status::Stopped, Lifecycle::Stop, None);

        let snapshot = self.snapshot();
        self.persist(&snapshot).await;
        snapshot
    }

    fn promote(
        &self,
        allowed: fn(&Status) -> bool,
        to: Status,
        lifecycle: Lifecycle,
        error: Option<String>,
    ) -> Option<WorkflowSnapshot> {
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

        debug!("Workflow '{}' -> {}", self.inner.id, to);
        self.emit(lifecycle, snapshot.clone());
        Some(snapshot)
    }

    /// Re-publishes an event from a work (or one of its steps) and folds
    /// work-level events into the workflow's status.
    fn on_work_event(&self, event: &Event) {
        self.inner.hub.emit(event);

        if event.level() != ComponentKind::Work {
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

    fn upgrade(weak: &Weak<WorkflowInner>) -> Option<Workflow> {
        weak.upgrade().map(|inner| Workflow { inner })
    }

    /// Replaces the state of the whole tree with an in-process snapshot.
    ///
    /// Works and steps are matched by id; snapshot entries without a live
    /// counterpart are skipped. Emits `workflow:change`.
    pub fn restore(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        self.check_id(snapshot)?;
        self.apply(snapshot, RestoreMode::Exact);
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(())
    }

    /// Loads the tree's persisted state from `workflow:{id}`.
    ///
    /// Anything stored as RUNNING or PAUSED was interrupted and comes back
    /// PENDING; settled works and steps keep their results and are not run
    /// again. Returns whether a snapshot was found.
    pub async fn auto_restore(&self) -> Result<bool> {
        let _ = self.inner.restored.set(());
        self.load_persisted().await
    }

    async fn ensure_restored(&self) {
        self.inner
            .restored
            .get_or_init(|| async {
                if let Err(e) = self.load_persisted().await {
                    warn!("Could not restore workflow '{}': {}", self.inner.id, e);
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

        let snapshot: WorkflowSnapshot = serde_json::from_value(value)?;
        self.check_id(&snapshot)?;
        self.apply(&snapshot, RestoreMode::AfterRestart);
        info!("Restored workflow '{}' ({})", self.inner.id, self.status());
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(true)
    }

    fn check_id(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        if snapshot.id != self.inner.id {
            return Err(Error::SnapshotMismatch {
                kind: ComponentKind::Workflow,
                expected: self.inner.id.clone(),
                found: snapshot.id.clone(),
            });
        }
        Ok(())
    }

    fn apply(&self, snapshot: &WorkflowSnapshot, mode: RestoreMode) {
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

        for work_snapshot in &snapshot.works {
            match self.work(&work_snapshot.id) {
                Some(work) => work.apply(work_snapshot, mode),
                None => warn!(
                    "Workflow '{}': snapshot has unknown work '{}' - skipping",
                    self.inner.id, work_snapshot.id
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

    /// Deletes the persisted snapshots of the whole tree.
    pub async fn purge(&self) -> Result<()> {
        for work in self.works() {
            work.purge().await?;
        }
        if let Some(storage) = self.storage() {
            storage.delete(&self.storage_key()).await?;
        }
        Ok(())
    }

    async fn persist(&self, snapshot: &WorkflowSnapshot) {
        let Some(storage) = self.storage() else {
            return;
        };
        let result = match serde_json::to_value(snapshot) {
            Ok(value) => storage.set(&self.storage_key(), value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist workflow '{}': {}", self.inner.id, e);
        }
    }

    fn emit(&self, lifecycle: Lifecycle, snapshot: WorkflowSnapshot) {
        self.inner.hub.emit(&Event::Workflow { lifecycle, snapshot });
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("works", &self.len())
            .finish()
    }
}
