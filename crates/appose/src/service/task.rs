//! Tasks
//!
//! A task is one script execution requested from a service. Its lifecycle:
//!
//! ```text
//! Created → Queued → Running → { Complete | Failed | Canceled }
//! ```
//!
//! Terminal states are final. Status, outputs and error are fixed once a
//! task is terminal, and later frames for it are ignored.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ServiceInner;
use crate::error::Error;
use crate::protocol::{Request, Response, TaskId};
use crate::shm::{self, NdArray};
use crate::value::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Status, events and errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Why a task did not complete, or why a task operation was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// The worker reported a failure for this task
    #[error("Task failed: {0}")]
    Failed(String),

    /// The worker process went away while the task was pending
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// The connection carried a malformed or out-of-sequence frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Caller misuse; the task and service are unaffected
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// `wait_for` gave up; the task is still live
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    Launch,
    Update,
    Completion,
    Cancelation,
    Failure,
    Crash,
}

/// Snapshot delivered to task listeners on every status-relevant frame
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task: TaskId,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub current: u64,
    pub maximum: u64,
}

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// Named inputs for a task.
///
/// Arrays are moved into the task. They come back through
/// [`Task::take_input_arrays`] once the task is terminal, so the caller
/// cannot mutate them while the worker may be reading.
#[derive(Debug, Default)]
pub struct Inputs {
    values: BTreeMap<String, Value>,
    arrays: HashMap<String, NdArray>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert_value(name, value);
        self
    }

    pub fn array(mut self, name: impl Into<String>, array: NdArray) -> Self {
        self.insert_array(name, array);
        self
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.arrays.remove(&name);
        self.values.insert(name, value.into());
    }

    pub fn insert_array(&mut self, name: impl Into<String>, array: NdArray) {
        let name = name.into();
        self.values
            .insert(name.clone(), Value::NdArray(array.reference()));
        self.arrays.insert(name, array);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Wire form of the inputs
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

/// Named results of a completed task.
///
/// Output arrays belong to the parent once COMPLETION arrives. The first
/// [`Outputs::array`] call for a segment returns the owning handle, later
/// calls attach without ownership. Segments never claimed are unlinked when
/// the outputs are dropped.
pub struct Outputs {
    values: BTreeMap<String, Value>,
    claimed: Mutex<HashSet<String>>,
}

impl Outputs {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Map the output array `name` into this process without copying
    pub fn array(&self, name: &str) -> Result<NdArray, Error> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::NoSuchOutput(name.to_string()))?;
        let reference = value
            .as_ndarray()
            .ok_or_else(|| Error::NotAnArray(name.to_string()))?;

        let mut array = NdArray::attach(reference)?;
        if self.claimed.lock().insert(reference.name.clone()) {
            array.adopt();
        }
        Ok(array)
    }
}

impl fmt::Debug for Outputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl Drop for Outputs {
    fn drop(&mut self) {
        let claimed = self.claimed.get_mut();
        for value in self.values.values() {
            for reference in value.ndarray_refs() {
                if claimed.insert(reference.name.clone()) {
                    if let Err(e) = shm::unlink_name(&reference.name) {
                        warn!("Failed to release output array {}: {}", reference.name, e);
                    }
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared task state
// ─────────────────────────────────────────────────────────────────────────────

struct TaskState {
    status: TaskStatus,
    message: Option<String>,
    current: u64,
    maximum: u64,
    outputs: Option<Arc<Outputs>>,
    error: Option<TaskError>,
    cancel_requested: bool,
    arrays: HashMap<String, NdArray>,
}

impl TaskState {
    fn event(&self, task: TaskId, kind: TaskEventKind) -> TaskEvent {
        TaskEvent {
            task,
            kind,
            status: self.status,
            message: self.message.clone(),
            current: self.current,
            maximum: self.maximum,
        }
    }
}

/// Task state shared between the caller's handle and the service listener
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    script: String,
    inputs: BTreeMap<String, Value>,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    listeners: RwLock<Vec<Listener>>,
}

impl TaskShared {
    pub(crate) fn new(script: String, inputs: Inputs) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Created);
        Self {
            id: uuid::Uuid::new_v4(),
            script,
            inputs: inputs.values,
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                message: None,
                current: 0,
                maximum: 1,
                outputs: None,
                error: None,
                cancel_requested: false,
                arrays: inputs.arrays,
            }),
            status_tx,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn mark_queued(&self) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Created {
            self.transition(&mut state, TaskStatus::Queued);
        }
    }

    /// Change status and notify waiters. Callers hold the state lock, so
    /// the watch never lags behind a later transition.
    fn transition(&self, state: &mut TaskState, status: TaskStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Apply an inbound frame. Returns whether the task became terminal, or
    /// a description of the violation when the frame is out of sequence.
    pub(crate) fn handle_response(&self, response: Response) -> Result<bool, String> {
        let event = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                debug!(
                    "Ignoring {} frame for finished task {}",
                    response.kind(),
                    self.id
                );
                return Ok(false);
            }
            if state.status != TaskStatus::Running {
                return Err(format!(
                    "{} frame for task {} which is {}",
                    response.kind(),
                    self.id,
                    state.status
                ));
            }

            let kind = match response {
                Response::Launched { .. } => TaskEventKind::Launch,
                Response::Update {
                    message,
                    current,
                    maximum,
                    ..
                } => {
                    if message.is_some() {
                        state.message = message;
                    }
                    if let Some(current) = current {
                        state.current = current;
                    }
                    if let Some(maximum) = maximum {
                        state.maximum = maximum;
                    }
                    TaskEventKind::Update
                }
                Response::Completion { outputs, .. } => {
                    self.transition(&mut state, TaskStatus::Complete);
                    state.outputs = Some(Arc::new(Outputs::new(outputs)));
                    TaskEventKind::Completion
                }
                Response::Failure { error, .. } => {
                    self.transition(&mut state, TaskStatus::Failed);
                    state.error = Some(TaskError::Failed(error.clone()));
                    state.message = Some(error);
                    TaskEventKind::Failure
                }
                Response::Canceled { .. } => {
                    self.transition(&mut state, TaskStatus::Canceled);
                    TaskEventKind::Cancelation
                }
                Response::Crash { error } => {
                    self.transition(&mut state, TaskStatus::Failed);
                    state.error = Some(TaskError::WorkerCrashed(error.clone()));
                    state.message = Some(error);
                    TaskEventKind::Crash
                }
            };
            state.event(self.id, kind)
        };

        let terminal = event.status.is_terminal();
        self.publish(event);
        Ok(terminal)
    }

    /// Fail the task because its connection died. No-op if already terminal.
    pub(crate) fn fail(&self, error: TaskError) -> bool {
        let event = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            self.transition(&mut state, TaskStatus::Failed);
            state.message = Some(error.to_string());
            state.error = Some(error);
            state.event(self.id, TaskEventKind::Crash)
        };
        self.publish(event);
        true
    }

    /// Run listeners outside the state lock
    fn publish(&self, event: TaskEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task handle
// ─────────────────────────────────────────────────────────────────────────────

/// Caller handle to a task submitted with [`Service::task`](super::Service::task)
pub struct Task {
    shared: Arc<TaskShared>,
    service: Arc<ServiceInner>,
}

impl Task {
    pub(crate) fn new(shared: Arc<TaskShared>, service: Arc<ServiceInner>) -> Self {
        Self { shared, service }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn script(&self) -> &str {
        &self.shared.script
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.status()
    }

    /// Last progress message, or the failure description
    pub fn message(&self) -> Option<String> {
        self.shared.state.lock().message.clone()
    }

    /// `(current, maximum)` from the latest update
    pub fn progress(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        (state.current, state.maximum)
    }

    /// The recorded cause of a failed task
    pub fn error(&self) -> Option<TaskError> {
        self.shared.state.lock().error.clone()
    }

    /// Register a listener for task events.
    ///
    /// Listeners run on the service's listener task, in frame order. They
    /// must return promptly.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    /// Send LAUNCH and move the task to `Running`
    pub async fn start(&self) -> Result<(), TaskError> {
        {
            let mut state = self.shared.state.lock();
            if state.status != TaskStatus::Queued {
                return Err(TaskError::InvalidState(format!(
                    "cannot start task {} in state {}",
                    self.shared.id, state.status
                )));
            }
            self.shared.transition(&mut state, TaskStatus::Running);
        }

        let request = Request::Launch {
            task: self.shared.id,
            script: self.shared.script.clone(),
            inputs: self.shared.inputs.clone(),
        };
        if let Err(e) = self.service.send(&request).await {
            let error = TaskError::WorkerCrashed(format!("could not launch task: {e}"));
            self.service.tasks.remove(&self.shared.id);
            self.shared.fail(error.clone());
            return Err(error);
        }
        debug!("Launched task {} on service {}", self.shared.id, self.service.id);
        Ok(())
    }

    /// Wait until the task is terminal.
    ///
    /// Returns `Complete` or `Canceled`, or the recorded [`TaskError`] when
    /// the task failed. A timeout leaves the task and worker untouched.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> Result<TaskStatus, TaskError> {
        let status = self.status();
        if matches!(status, TaskStatus::Created | TaskStatus::Queued) {
            return Err(TaskError::InvalidState(format!(
                "task {} has not been started",
                self.shared.id
            )));
        }

        let mut rx = self.shared.subscribe();
        let wait = async move { rx.wait_for(|s| s.is_terminal()).await.map(|s| *s) };
        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TaskError::Timeout(limit))?,
            None => wait.await,
        }
        .map_err(|_| TaskError::WorkerCrashed("task state was dropped".into()))?;

        match status {
            TaskStatus::Failed => Err(self
                .error()
                .unwrap_or_else(|| TaskError::Failed("unknown error".into()))),
            other => Ok(other),
        }
    }

    /// Ask the worker to abort the task.
    ///
    /// No-op once terminal. A task that was never started is canceled
    /// locally. Cancellation is advisory: whichever terminal frame arrives
    /// first wins.
    pub async fn cancel(&self) -> Result<(), TaskError> {
        let event = {
            let mut state = self.shared.state.lock();
            match state.status {
                status if status.is_terminal() => return Ok(()),
                TaskStatus::Created | TaskStatus::Queued => {
                    self.shared.transition(&mut state, TaskStatus::Canceled);
                    Some(state.event(self.shared.id, TaskEventKind::Cancelation))
                }
                _ => {
                    if state.cancel_requested {
                        return Ok(());
                    }
                    state.cancel_requested = true;
                    None
                }
            }
        };

        if let Some(event) = event {
            self.service.tasks.remove(&self.shared.id);
            self.shared.publish(event);
            return Ok(());
        }

        info!("Requesting cancellation of task {}", self.shared.id);
        self.service
            .send(&Request::Cancel {
                task: self.shared.id,
            })
            .await
            .map_err(|e| TaskError::WorkerCrashed(format!("could not send cancellation: {e}")))?;
        self.service.watch_cancellation(Arc::clone(&self.shared));
        Ok(())
    }

    /// Outputs of a completed task
    pub fn outputs(&self) -> Result<Arc<Outputs>, TaskError> {
        let state = self.shared.state.lock();
        match (&state.outputs, state.status) {
            (Some(outputs), TaskStatus::Complete) => Ok(Arc::clone(outputs)),
            (_, status) => Err(TaskError::InvalidState(format!(
                "outputs of task {} are unavailable while {}",
                self.shared.id, status
            ))),
        }
    }

    /// Hand the input arrays back once the task is terminal
    pub fn take_input_arrays(&self) -> Result<HashMap<String, NdArray>, TaskError> {
        let mut state = self.shared.state.lock();
        if !state.status.is_terminal() {
            return Err(TaskError::InvalidState(format!(
                "input arrays of task {} are in use while {}",
                self.shared.id, state.status
            )));
        }
        Ok(std::mem::take(&mut state.arrays))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}
