//! Runtime Step
//!
//! The atomic unit of work: a user-supplied async function plus the status
//! machine around it. Steps are where pause/resume actually suspends
//! execution; works and workflows only fan the request out.
//!
//! # Execution
//!
//! `start` moves a pending step to RUNNING, waits on the pause gate, runs
//! the function on the tokio runtime, waits on the gate again and only then
//! settles to SUCCESS. A pause requested while the function is in flight
//! therefore takes effect at the next safe point; the function itself is
//! never interrupted.
//!
//! `stop` settles the step to STOPPED and stops waiting for the function.
//! The spawned task is detached, not aborted: it keeps running to
//! completion and its result is discarded. Resources it holds are not
//! released by `stop`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::context::{Context, StepContext};
use super::gate::PauseGate;
use super::RestoreMode;
use crate::error::{Error, Result, RunError};
use crate::events::{Event, EventHub, EventKind, Lifecycle, ListenerId};
use crate::storage::{storage_key, Storage};
use crate::workflow::model::{ComponentKind, Status};
use crate::workflow::snapshot::StepSnapshot;

/// Boxed future returned by a step function.
pub type RunFuture = BoxFuture<'static, std::result::Result<Value, RunError>>;

type RunFn = dyn Fn(Value, StepContext) -> RunFuture + Send + Sync;

#[derive(Debug, Default)]
struct StepState {
    name: Option<String>,
    description: Option<String>,
    status: Status,
    input: Option<Value>,
    output: Option<Value>,
    error: Option<String>,
    /// Token of the current run; replaced whenever a new run can begin
    cancellation: CancellationToken,
}

struct StepInner {
    id: String,
    run: Arc<RunFn>,
    state: Mutex<StepState>,
    gate: PauseGate,
    hub: EventHub,
    storage: RwLock<Option<Arc<dyn Storage>>>,
    restored: OnceCell<()>,
}

/// A single executable unit.
///
/// `Step` is a cheap handle: clones share the same state, so a caller can
/// keep a clone to pause or inspect a step after adding it to a work.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::Step;
/// use serde_json::{json, Value};
///
/// # async fn demo() -> flowrunner::Result<()> {
/// let double = Step::new("double", |input: Value, _ctx| async move {
///     Ok(json!(input.as_i64().unwrap_or(0) * 2))
/// })
/// .with_name("Double the input");
///
/// let snapshot = double.run(json!(21)).await?;
/// assert_eq!(snapshot.output, Some(json!(42)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepInner>,
}

impl Step {
    /// Creates a pending step around an async function.
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RunError>> + Send + 'static,
    {
        let run: Arc<RunFn> = Arc::new(move |input, ctx| Box::pin(run(input, ctx)) as RunFuture);
        Self {
            inner: Arc::new(StepInner {
                id: id.into().trim().to_string(),
                run,
                state: Mutex::new(StepState::default()),
                gate: PauseGate::new(),
                hub: EventHub::new(),
                storage: RwLock::new(None),
                restored: OnceCell::new(),
            }),
        }
    }

    /// Creates a step around a synchronous function.
    pub fn from_fn<F>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, RunError> + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        Self::new(id, move |input, _ctx| {
            let run = Arc::clone(&run);
            async move { run(input) }
        })
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.inner.state.lock().name = Some(name.into());
        self
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.inner.state.lock().description = Some(description.into());
        self
    }

    /// Persists this step's snapshot on every transition.
    pub fn with_storage(self, storage: Arc<dyn Storage>) -> Self {
        *self.inner.storage.write() = Some(storage);
        self
    }

    /// Hands `storage` to the step unless it already has one.
    pub(crate) fn inherit_storage(&self, storage: &Arc<dyn Storage>) {
        let mut slot = self.inner.storage.write();
        if slot.is_none() {
            *slot = Some(Arc::clone(storage));
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

    pub fn input(&self) -> Option<Value> {
        self.inner.state.lock().input.clone()
    }

    pub fn output(&self) -> Option<Value> {
        self.inner.state.lock().output.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    /// Storage key for this step, `step:{id}`.
    pub fn storage_key(&self) -> String {
        storage_key(ComponentKind::Step, &self.inner.id)
    }

    /// The step's event hub.
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

    /// Captures the current state.
    pub fn snapshot(&self) -> StepSnapshot {
        let state = self.inner.state.lock();
        self.capture(&state)
    }

    fn capture(&self, state: &StepState) -> StepSnapshot {
        StepSnapshot {
            id: self.inner.id.clone(),
            name: state.name.clone(),
            description: state.description.clone(),
            kind: ComponentKind::Step,
            status: state.status,
            input: state.input.clone(),
            output: state.output.clone(),
            error: state.error.clone(),
        }
    }

    /// Starts the step with no enclosing work or workflow.
    pub async fn run(&self, input: Value) -> Result<StepSnapshot> {
        self.start(input, Context::new()).await
    }

    /// Executes the step function once.
    ///
    /// Only a pending step executes. Calling `start` on a step in any other
    /// status returns its current snapshot without running the function
    /// again, so a second call never changes the first call's output.
    ///
    /// A failing function settles the step to FAILED, emits `step:failed`
    /// and returns [`Error::StepFailed`].
    pub async fn start(&self, input: Value, ctx: Context) -> Result<StepSnapshot> {
        self.ensure_restored().await;

        let (snapshot, cancellation) = {
            let mut state = self.inner.state.lock();
            if !state.status.can_start() {
                debug!("Step '{}' is {} - not starting again", self.inner.id, state.status);
                return Ok(self.capture(&state));
            }
            state.status = Status::Running;
            state.input = Some(input.clone());
            state.output = None;
            state.error = None;
            state.cancellation = CancellationToken::new();
            (self.capture(&state), state.cancellation.clone())
        };

        info!("Starting step: {}", self.inner.id);
        self.persist(&snapshot).await;
        self.emit(Lifecycle::Start, snapshot);

        if !self.wait_while_paused().await {
            return Ok(self.snapshot());
        }

        let step_ctx = StepContext::new(self.inner.id.clone(), ctx, cancellation.clone());
        let task = tokio::spawn((self.inner.run)(input, step_ctx));

        let joined = tokio::select! {
            joined = task => joined,
            _ = cancellation.cancelled() => {
                debug!("Step '{}' stopped while running - abandoning its task", self.inner.id);
                return Ok(self.snapshot());
            }
        };

        let result = match joined {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) if e.is_panic() => Err(format!("panicked: {}", e)),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(output) => self.succeed(output).await,
            Err(message) => Err(self.fail(message).await),
        }
    }

    /// Blocks while the step is paused.
    ///
    /// Returns false if the step left RUNNING for any reason other than a
    /// pause, in which case the caller must not settle it.
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

    async fn succeed(&self, output: Value) -> Result<StepSnapshot> {
        // A pause that arrived while the function ran still holds the step here
        if !self.wait_while_paused().await {
            debug!("Step '{}' settled elsewhere - discarding its output", self.inner.id);
            return Ok(self.snapshot());
        }

        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.status != Status::Running {
                return Ok(self.capture(&state));
            }
            state.status = Status::Success;
            state.output = Some(output);
            self.capture(&state)
        };

        info!("Step '{}' completed successfully", self.inner.id);
        self.persist(&snapshot).await;
        self.emit(Lifecycle::Success, snapshot.clone());
        Ok(snapshot)
    }

    async fn fail(&self, message: String) -> Error {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.status.is_active() {
                state.status = Status::Failed;
                state.error = Some(message.clone());
                self.inner.gate.open();
                Some(self.capture(&state))
            } else {
                None
            }
        };

        if let Some(snapshot) = snapshot {
            error!("Step '{}' failed: {}", self.inner.id, message);
            self.persist(&snapshot).await;
            self.emit(Lifecycle::Failed, snapshot);
        }

        Error::StepFailed {
            step: self.inner.id.clone(),
            message,
        }
    }

    /// Suspends a running step at its next safe point.
    ///
    /// No-op unless the step is RUNNING.
    pub async fn pause(&self) -> StepSnapshot {
        self.ensure_restored().await;
        self.transition(Status::can_pause, Status::Paused, Lifecycle::Pause)
            .await
    }

    /// Releases a paused step. No-op unless the step is PAUSED.
    pub async fn resume(&self) -> StepSnapshot {
        self.ensure_restored().await;
        self.transition(Status::can_resume, Status::Running, Lifecycle::Resume)
            .await
    }

    /// Settles a running or paused step to STOPPED.
    ///
    /// The step function, if in flight, keeps running in the background;
    /// its result is discarded. No-op in any other status.
    pub async fn stop(&self) -> StepSnapshot {
        self.transition(Status::can_stop, Status::Stopped, Lifecycle::Stop)
            .await
    }

    async fn transition(
        &self,
        allowed: fn(&Status) -> bool,
        to: Status,
        lifecycle: Lifecycle,
    ) -> StepSnapshot {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if !allowed(&state.status) {
                debug!(
                    "Step '{}' is {} - ignoring {}",
                    self.inner.id, state.status, lifecycle
                );
                return self.capture(&state);
            }
            state.status = to;
            // Gate changes under the state lock so waiters never see a stale pair
            if to == Status::Paused {
                self.inner.gate.close();
            } else {
                self.inner.gate.open();
            }
            if to == Status::Stopped {
                state.cancellation.cancel();
            }
            self.capture(&state)
        };

        info!("Step '{}' -> {}", self.inner.id, to);
        self.persist(&snapshot).await;
        self.emit(lifecycle, snapshot.clone());
        snapshot
    }

    /// Replaces the step's state with a snapshot taken in this process.
    ///
    /// Status, input, output and error are copied as-is. A PAUSED snapshot
    /// closes the pause gate so a later `resume` flips the status back; there
    /// is no suspended execution behind it. Emits `step:change`.
    pub fn restore(&self, snapshot: &StepSnapshot) -> Result<()> {
        self.check_id(snapshot)?;
        self.apply(snapshot, RestoreMode::Exact);
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(())
    }

    /// Loads this step's persisted snapshot, if any, and applies it.
    ///
    /// Meant for a fresh process picking up an earlier run: a snapshot that
    /// was RUNNING or PAUSED is restored as PENDING so the next `start`
    /// executes the function again. Returns whether a snapshot was found.
    ///
    /// Runs automatically before the first `start`, `pause` or `resume`.
    pub async fn auto_restore(&self) -> Result<bool> {
        let _ = self.inner.restored.set(());
        self.load_persisted().await
    }

    async fn ensure_restored(&self) {
        self.inner
            .restored
            .get_or_init(|| async {
                if let Err(e) = self.load_persisted().await {
                    warn!("Could not restore step '{}': {}", self.inner.id, e);
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

        let snapshot: StepSnapshot = serde_json::from_value(value)?;
        self.check_id(&snapshot)?;
        self.apply(&snapshot, RestoreMode::AfterRestart);
        info!("Restored step '{}' ({})", self.inner.id, self.status());
        self.emit(Lifecycle::Change, self.snapshot());
        Ok(true)
    }

    fn check_id(&self, snapshot: &StepSnapshot) -> Result<()> {
        if snapshot.id != self.inner.id {
            return Err(Error::SnapshotMismatch {
                kind: ComponentKind::Step,
                expected: self.inner.id.clone(),
                found: snapshot.id.clone(),
            });
        }
        Ok(())
    }

    /// Copies snapshot fields without emitting; parents call this while
    /// restoring a whole tree.
    pub(crate) fn apply(&self, snapshot: &StepSnapshot, mode: RestoreMode) {
        let status = match mode {
            RestoreMode::Exact => {
                // Explicit state wins over anything in storage
                let _ = self.inner.restored.set(());
                snapshot.status
            }
            RestoreMode::AfterRestart => snapshot.status.after_restart(),
        };

        let mut state = self.inner.state.lock();
        state.status = status;
        state.input = snapshot.input.clone();
        state.output = snapshot.output.clone();
        state.error = snapshot.error.clone();
        if !status.is_terminal() {
            state.cancellation = CancellationToken::new();
        }
        if status == Status::Paused {
            self.inner.gate.close();
        } else {
            self.inner.gate.open();
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

    /// Deletes this step's persisted snapshot.
    pub async fn purge(&self) -> Result<()> {
        if let Some(storage) = self.storage() {
            storage.delete(&self.storage_key()).await?;
        }
        Ok(())
    }

    /// Best-effort write used on every transition.
    async fn persist(&self, snapshot: &StepSnapshot) {
        let Some(storage) = self.storage() else {
            return;
        };
        let result = match serde_json::to_value(snapshot) {
            Ok(value) => storage.set(&self.storage_key(), value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist step '{}': {}", self.inner.id, e);
        }
    }

    fn emit(&self, lifecycle: Lifecycle, snapshot: StepSnapshot) {
        self.inner.hub.emit(&Event::Step { lifecycle, snapshot });
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}
