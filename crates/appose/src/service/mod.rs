//! Worker process supervisor
//!
//! A [`Service`] owns one worker process, or any framed stream pair, and
//! multiplexes concurrent [`Task`]s over it. One listener task reads
//! frames and routes them by task id. Outbound frames share a single
//! writer behind an async mutex, so frames never interleave.

mod command;
mod listener;
mod task;

pub use command::{DEFAULT_WORKER, WorkerCommand};
pub use task::{Inputs, Outputs, Task, TaskError, TaskEvent, TaskEventKind, TaskStatus};

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{DEFAULT_MAX_FRAME_LEN, FrameWriter, ProtocolError, Request, TaskId};
use crate::value::Value;
use task::TaskShared;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type DebugListener = Arc<dyn Fn(&str) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and errors
// ─────────────────────────────────────────────────────────────────────────────

/// Timeouts and limits for one service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long `close()` waits for the worker to exit before killing it
    pub shutdown_grace: Duration,
    /// How long a canceled task may stay pending before the worker is
    /// considered unresponsive
    pub cancel_grace: Duration,
    /// Largest frame accepted from the worker
    pub max_frame_len: usize,
    /// Capture worker stderr and route it to `tracing` and debug listeners
    pub forward_stderr: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            forward_stderr: true,
        }
    }
}

impl ServiceConfig {
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn forward_stderr(mut self, forward: bool) -> Self {
        self.forward_stderr = forward;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Service {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Active = 0,
    Closed = 1,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared service state
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct ServiceInner {
    pub(crate) id: String,
    config: ServiceConfig,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    pub(crate) tasks: DashMap<TaskId, Arc<TaskShared>>,
    state: AtomicU8,
    closed_by_caller: AtomicBool,
    /// Set once a caller's close has run to completion
    closing: OnceCell<()>,
    child: Mutex<Option<Child>>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    debug_listeners: RwLock<Vec<DebugListener>>,
}

impl ServiceInner {
    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ServiceState::Closed as u8
    }

    /// Returns whether this call performed the transition
    fn mark_closed(&self) -> bool {
        self.state
            .swap(ServiceState::Closed as u8, Ordering::AcqRel)
            == ServiceState::Active as u8
    }

    pub(crate) async fn send(&self, request: &Request) -> Result<(), ServiceError> {
        if self.is_closed() {
            return Err(ServiceError::Closed(self.id.clone()));
        }
        let mut writer = self.writer.lock().await;
        writer.send(request).await?;
        Ok(())
    }

    /// Fail every pending task; they are removed from the table
    fn fail_pending(&self, error: TaskError) {
        let ids: Vec<TaskId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                if task.fail(error.clone()) {
                    debug!("Task {} on service {} failed: {}", id, self.id, error);
                }
            }
        }
    }

    /// Close after the connection became unusable
    pub(crate) async fn shut_down(&self, error: TaskError) {
        self.mark_closed();
        self.fail_pending(error);
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!("Killing worker of service {}", self.id);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill worker of service {}: {}", self.id, e);
                }
            }
        }
    }

    /// Best description of why the worker went away
    pub(crate) async fn exit_detail(&self) -> String {
        let mut child = self.child.lock().await;
        let Some(child) = child.as_mut() else {
            return "worker closed its output stream".to_string();
        };
        match tokio::time::timeout(Duration::from_millis(250), child.wait()).await {
            Ok(Ok(status)) => format!("worker exited with {status}"),
            Ok(Err(e)) => format!("worker closed its output stream ({e})"),
            Err(_) => "worker closed its output stream".to_string(),
        }
    }

    /// Close the service if a canceled task stays pending past the grace
    pub(crate) fn watch_cancellation(self: &Arc<Self>, task: Arc<TaskShared>) {
        let grace = self.config.cancel_grace;
        let weak = Arc::downgrade(self);
        let mut status = task.subscribe();
        tokio::spawn(async move {
            let finished = tokio::time::timeout(grace, status.wait_for(|s| s.is_terminal()))
                .await
                .is_ok();
            if finished {
                return;
            }
            if let Some(service) = weak.upgrade() {
                warn!(
                    "Task {} ignored cancellation for {:?}, treating worker of service {} as unresponsive",
                    task.id, grace, service.id
                );
                service
                    .shut_down(TaskError::WorkerCrashed(format!(
                        "worker did not respond to cancellation within {grace:?}"
                    )))
                    .await;
            }
        });
    }

    fn emit_debug(&self, line: &str) {
        let listeners = self.debug_listeners.read().clone();
        for listener in listeners.iter() {
            listener(line);
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running worker. Clones share the same worker.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Spawn a worker process and start listening to it
    pub async fn spawn(worker: &WorkerCommand, config: ServiceConfig) -> Result<Self, ServiceError> {
        info!("Spawning worker process: {}", worker);

        let mut cmd = worker.to_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if config.forward_stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            program: worker.program.display().to_string(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(ServiceError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ServiceError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let service = Self::build(Box::new(stdin), config, Some(child));
        service.start_listener(stdout);
        if let Some(stderr) = stderr {
            service.forward_stderr(stderr);
        }

        info!(
            "Service {} started (pid {})",
            service.inner.id,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        );
        Ok(service)
    }

    /// Attach to an already-connected framed stream pair.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_streams<R, W>(reader: R, writer: W, config: ServiceConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let service = Self::build(Box::new(writer), config, None);
        service.start_listener(reader);
        service
    }

    fn build(writer: BoxedWriter, config: ServiceConfig, child: Option<Child>) -> Self {
        let id = format!("service-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            inner: Arc::new(ServiceInner {
                id,
                config,
                writer: Mutex::new(FrameWriter::new(writer)),
                tasks: DashMap::new(),
                state: AtomicU8::new(ServiceState::Active as u8),
                closed_by_caller: AtomicBool::new(false),
                closing: OnceCell::new(),
                child: Mutex::new(child),
                listener: parking_lot::Mutex::new(None),
                debug_listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    fn start_listener<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let handle = listener::spawn(&self.inner, reader);
        *self.inner.listener.lock() = Some(handle);
    }

    fn forward_stderr(&self, stderr: ChildStderr) {
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "appose::worker", "[{}] {}", id, line);
                match weak.upgrade() {
                    Some(service) => service.emit_debug(&line),
                    None => continue,
                }
            }
        });
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServiceState {
        if self.inner.is_closed() {
            ServiceState::Closed
        } else {
            ServiceState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceState::Active
    }

    /// Closed by a worker failure rather than by [`Service::close`]
    pub fn crashed(&self) -> bool {
        self.inner.is_closed() && !self.inner.closed_by_caller.load(Ordering::Acquire)
    }

    /// Number of tasks launched or queued and not yet terminal
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Subscribe to the worker's stderr, one call per line
    pub fn on_debug<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.debug_listeners.write().push(Arc::new(listener));
    }

    /// Create a task in `Queued`. Nothing is sent until [`Task::start`].
    pub fn task(&self, script: impl Into<String>, inputs: Inputs) -> Result<Task, TaskError> {
        if self.inner.is_closed() {
            return Err(TaskError::InvalidState(format!(
                "service {} is closed",
                self.inner.id
            )));
        }

        if let Some((name, f)) = inputs
            .values()
            .iter()
            .find_map(|(name, value)| value.non_finite().map(|f| (name, f)))
        {
            return Err(TaskError::InvalidState(format!(
                "input {name} is {f}, which cannot be sent"
            )));
        }

        let shared = Arc::new(TaskShared::new(script.into(), inputs));
        shared.mark_queued();
        self.inner.tasks.insert(shared.id, Arc::clone(&shared));

        // A concurrent shutdown may have drained the table before the insert
        if self.inner.is_closed() {
            self.inner.tasks.remove(&shared.id);
            return Err(TaskError::InvalidState(format!(
                "service {} is closed",
                self.inner.id
            )));
        }
        Ok(Task::new(shared, Arc::clone(&self.inner)))
    }

    /// Create and start a task in one step
    pub async fn run(&self, script: impl Into<String>, inputs: Inputs) -> Result<Task, TaskError> {
        let task = self.task(script, inputs)?;
        task.start().await?;
        Ok(task)
    }

    /// Shorthand for a task with only inline inputs
    pub fn task_with_values<I, K>(&self, script: impl Into<String>, values: I) -> Result<Task, TaskError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut inputs = Inputs::new();
        for (name, value) in values {
            inputs.insert_value(name, value);
        }
        self.task(script, inputs)
    }

    /// Shut the worker down. Idempotent.
    ///
    /// Sends `shutdown`, waits up to `shutdown_grace` for the worker to
    /// exit, then kills it. Tasks still pending afterwards fail with
    /// [`TaskError::WorkerCrashed`]. Concurrent callers all return once
    /// the first close has finished.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.is_closed() {
            inner.closed_by_caller.store(true, Ordering::Release);
        }
        inner.closing.get_or_init(|| inner.close_worker()).await;
    }
}

impl ServiceInner {
    async fn close_worker(&self) {
        let grace = self.config.shutdown_grace;
        let deadline = Instant::now() + grace;

        if self.mark_closed() {
            info!("Closing service {}", self.id);
            let farewell = async {
                let mut writer = self.writer.lock().await;
                if let Err(e) = writer.send(&Request::Shutdown).await {
                    debug!("Service {} could not send shutdown: {}", self.id, e);
                }
                if let Err(e) = writer.shutdown().await {
                    debug!("Service {} could not close its writer: {}", self.id, e);
                }
            };
            if tokio::time::timeout_at(deadline, farewell).await.is_err() {
                warn!("Service {} could not deliver shutdown within {:?}", self.id, grace);
            }
        }

        let listener = self.listener.lock().take();
        if let Some(mut handle) = listener {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Service {} worker did not exit within {:?}, killing", self.id, grace);
                handle.abort();
            }
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match child.try_wait() {
                Ok(Some(status)) => info!("Service {} worker exited with status: {}", self.id, status),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill worker of service {}: {}", self.id, e);
                    }
                }
            }
        }

        self.fail_pending(TaskError::WorkerCrashed("service closed".into()));
        debug!("Service {} closed", self.id);
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending_tasks", &self.inner.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tokio::io::DuplexStream;

    use crate::protocol::{FrameReader, Response};
    use crate::shm::NdArray;

    /// The worker end of an in-memory connection
    struct FakeWorker {
        reader: FrameReader<DuplexStream>,
        writer: FrameWriter<DuplexStream>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Request {
            self.reader.recv().await.unwrap().unwrap()
        }

        async fn reply(&mut self, response: Response) {
            self.writer.send(&response).await.unwrap();
        }

        async fn expect_launch(&mut self) -> TaskId {
            match self.next_request().await {
                Request::Launch { task, .. } => task,
                other => panic!("expected launch, got {other:?}"),
            }
        }
    }

    fn connect(config: ServiceConfig) -> (Service, FakeWorker) {
        connect_with_buffer(1 << 16, config)
    }

    fn connect_with_buffer(buffer: usize, config: ServiceConfig) -> (Service, FakeWorker) {
        let (parent_out, worker_in) = tokio::io::duplex(buffer);
        let (worker_out, parent_in) = tokio::io::duplex(buffer);
        let service = Service::from_streams(parent_in, parent_out, config);
        let worker = FakeWorker {
            reader: FrameReader::new(worker_in),
            writer: FrameWriter::new(worker_out),
        };
        (service, worker)
    }

    fn quick_config() -> ServiceConfig {
        ServiceConfig::default()
            .with_shutdown_grace(Duration::from_millis(100))
            .with_cancel_grace(Duration::from_millis(200))
    }

    fn completion(task: TaskId, name: &str, value: Value) -> Response {
        Response::Completion {
            task,
            outputs: BTreeMap::from([(name.to_string(), value)]),
        }
    }

    #[tokio::test]
    async fn concurrent_tasks_complete_out_of_order() {
        let (service, mut worker) = connect(quick_config());

        let first = service.task("first()", Inputs::new()).unwrap();
        let second = service.task("second()", Inputs::new()).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.status(), TaskStatus::Queued);

        first.start().await.unwrap();
        second.start().await.unwrap();
        assert_eq!(worker.expect_launch().await, first.id());
        assert_eq!(worker.expect_launch().await, second.id());

        worker.reply(Response::Launched { task: second.id() }).await;
        worker.reply(completion(second.id(), "n", Value::Int(2))).await;
        worker.reply(Response::Launched { task: first.id() }).await;
        worker.reply(completion(first.id(), "n", Value::Int(1))).await;

        assert_eq!(second.wait_for(None).await, Ok(TaskStatus::Complete));
        assert_eq!(first.wait_for(None).await, Ok(TaskStatus::Complete));
        assert_eq!(first.outputs().unwrap().get("n"), Some(&Value::Int(1)));
        assert_eq!(second.outputs().unwrap().get("n"), Some(&Value::Int(2)));
        assert_eq!(service.pending_tasks(), 0);
        assert!(service.is_active());
    }

    #[tokio::test]
    async fn unknown_task_ids_are_dropped() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        worker
            .reply(Response::Update {
                task: uuid::Uuid::new_v4(),
                message: Some("stray".into()),
                current: None,
                maximum: None,
            })
            .await;
        worker.reply(completion(task.id(), "ok", Value::Bool(true))).await;

        assert_eq!(task.wait_for(None).await, Ok(TaskStatus::Complete));
        assert!(service.is_active());
        assert_eq!(task.message(), None);
    }

    #[tokio::test]
    async fn malformed_frame_fails_every_pending_task() {
        let (service, mut worker) = connect(quick_config());
        let a = service.task("a()", Inputs::new()).unwrap();
        let b = service.task("b()", Inputs::new()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        worker.expect_launch().await;
        worker.expect_launch().await;

        worker.writer.write_frame(b"not json").await.unwrap();

        assert!(matches!(a.wait_for(None).await, Err(TaskError::Protocol(_))));
        assert!(matches!(b.wait_for(None).await, Err(TaskError::Protocol(_))));
        assert_eq!(service.state(), ServiceState::Closed);
        assert!(matches!(
            service.task("c()", Inputs::new()),
            Err(TaskError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_crashes_pending_tasks() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;
        drop(worker);

        let result = task.wait_for(Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(TaskError::WorkerCrashed(_))));
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(matches!(task.error(), Some(TaskError::WorkerCrashed(_))));
        assert!(!service.is_active());
    }

    #[tokio::test]
    async fn crash_frame_is_fatal_for_the_service() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        worker
            .reply(Response::Crash {
                error: "out of memory".into(),
            })
            .await;

        assert_eq!(
            task.wait_for(None).await,
            Err(TaskError::WorkerCrashed("out of memory".into()))
        );
        assert!(!service.is_active());
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_task() {
        let (service, mut worker) = connect(quick_config());
        let bad = service.task("fail()", Inputs::new()).unwrap();
        let good = service.task("ok()", Inputs::new()).unwrap();
        bad.start().await.unwrap();
        good.start().await.unwrap();
        worker.expect_launch().await;
        worker.expect_launch().await;

        worker
            .reply(Response::Failure {
                task: bad.id(),
                error: "division by zero".into(),
            })
            .await;
        worker.reply(completion(good.id(), "v", Value::Float(0.5))).await;

        assert_eq!(
            bad.wait_for(None).await,
            Err(TaskError::Failed("division by zero".into()))
        );
        assert_eq!(bad.message().as_deref(), Some("division by zero"));
        assert!(matches!(bad.outputs(), Err(TaskError::InvalidState(_))));
        assert_eq!(good.wait_for(None).await, Ok(TaskStatus::Complete));
        assert!(service.is_active());
    }

    #[tokio::test]
    async fn cancel_round_trip() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("sleep(10000)", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        task.cancel().await.unwrap();
        assert_eq!(worker.next_request().await, Request::Cancel { task: task.id() });
        worker.reply(Response::Canceled { task: task.id() }).await;

        assert_eq!(task.wait_for(None).await, Ok(TaskStatus::Canceled));
        assert!(service.is_active());
    }

    #[tokio::test]
    async fn completion_racing_a_cancel_wins() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        task.cancel().await.unwrap();
        worker.reply(completion(task.id(), "late", Value::Int(7))).await;
        worker.reply(Response::Canceled { task: task.id() }).await;

        assert_eq!(task.wait_for(None).await, Ok(TaskStatus::Complete));
        assert_eq!(task.outputs().unwrap().get("late"), Some(&Value::Int(7)));
    }

    #[tokio::test]
    async fn cancel_of_finished_or_unstarted_tasks_sends_nothing() {
        let (service, mut worker) = connect(quick_config());

        let unstarted = service.task("never()", Inputs::new()).unwrap();
        unstarted.cancel().await.unwrap();
        assert_eq!(unstarted.status(), TaskStatus::Canceled);
        assert_eq!(unstarted.wait_for(None).await, Ok(TaskStatus::Canceled));
        assert!(matches!(unstarted.start().await, Err(TaskError::InvalidState(_))));

        let done = service.task("work()", Inputs::new()).unwrap();
        done.start().await.unwrap();
        worker.expect_launch().await;
        worker.reply(completion(done.id(), "x", Value::Int(5))).await;
        done.wait_for(None).await.unwrap();
        done.cancel().await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(50), worker.next_request()).await;
        assert!(next.is_err(), "unexpected frame {next:?}");
        assert_eq!(done.status(), TaskStatus::Complete);
        assert_eq!(done.wait_for(None).await, Ok(TaskStatus::Complete));
        assert_eq!(done.error(), None);
        let outputs = done.outputs().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get("x"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn non_finite_inputs_are_refused() {
        let (service, _worker) = connect(quick_config());
        let result = service.task("work()", Inputs::new().value("sigma", f64::NAN));
        assert!(matches!(result, Err(TaskError::InvalidState(_))));
        assert_eq!(service.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn unanswered_cancel_closes_the_service() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("stuck()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        task.cancel().await.unwrap();
        assert!(matches!(worker.next_request().await, Request::Cancel { .. }));

        let result = task.wait_for(Some(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(TaskError::WorkerCrashed(_))));
        assert!(!service.is_active());
    }

    #[tokio::test]
    async fn wait_timeout_leaves_the_task_running() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("slow()", Inputs::new()).unwrap();
        assert!(matches!(task.wait_for(None).await, Err(TaskError::InvalidState(_))));

        task.start().await.unwrap();
        worker.expect_launch().await;

        let limit = Duration::from_millis(30);
        assert_eq!(task.wait_for(Some(limit)).await, Err(TaskError::Timeout(limit)));
        assert_eq!(task.status(), TaskStatus::Running);

        worker.reply(completion(task.id(), "done", Value::Bool(true))).await;
        assert_eq!(task.wait_for(None).await, Ok(TaskStatus::Complete));
    }

    #[tokio::test]
    async fn input_arrays_return_only_after_the_task_ends() {
        let (service, mut worker) = connect(quick_config());
        let image = NdArray::from_slice(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let name = image.name().to_string();

        let task = service
            .task("output r = rot90(image)", Inputs::new().array("image", image))
            .unwrap();
        task.start().await.unwrap();
        match worker.next_request().await {
            Request::Launch { inputs, .. } => {
                assert_eq!(inputs["image"].as_ndarray().unwrap().name, name);
            }
            other => panic!("expected launch, got {other:?}"),
        }

        assert!(matches!(task.take_input_arrays(), Err(TaskError::InvalidState(_))));
        worker.reply(Response::Canceled { task: task.id() }).await;
        task.wait_for(None).await.unwrap();

        let arrays = task.take_input_arrays().unwrap();
        assert_eq!(arrays["image"].as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn listeners_see_progress_updates() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.on_event(move |event| sink.lock().push((event.kind, event.current, event.maximum)));

        task.start().await.unwrap();
        worker.expect_launch().await;
        worker.reply(Response::Launched { task: task.id() }).await;
        worker
            .reply(Response::Update {
                task: task.id(),
                message: Some("tile 3 of 8".into()),
                current: Some(3),
                maximum: Some(8),
            })
            .await;
        worker.reply(completion(task.id(), "tiles", Value::Int(8))).await;
        task.wait_for(None).await.unwrap();

        assert_eq!(task.progress(), (3, 8));
        assert_eq!(task.message().as_deref(), Some("tile 3 of 8"));
        assert_eq!(
            *seen.lock(),
            vec![
                (TaskEventKind::Launch, 0, 1),
                (TaskEventKind::Update, 3, 8),
                (TaskEventKind::Completion, 3, 8),
            ]
        );
    }

    #[tokio::test]
    async fn close_sends_shutdown_and_is_idempotent() {
        let (service, mut worker) = connect(quick_config());
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        service.close().await;
        assert_eq!(worker.next_request().await, Request::Shutdown);
        assert_eq!(
            task.wait_for(None).await,
            Err(TaskError::WorkerCrashed("service closed".into()))
        );

        service.close().await;
        assert_eq!(service.state(), ServiceState::Closed);
        assert!(matches!(
            service.task("again()", Inputs::new()),
            Err(TaskError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn close_is_bounded_when_the_worker_stops_reading() {
        let (service, _worker) = connect_with_buffer(16, quick_config());
        let queued = service.task("never()", Inputs::new()).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(3), service.close()).await;
        assert!(closed.is_ok(), "close did not return");
        assert_eq!(service.state(), ServiceState::Closed);
        assert_eq!(queued.status(), TaskStatus::Failed);
        assert_eq!(service.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn concurrent_close_waits_for_the_first() {
        let (service, mut worker) =
            connect(quick_config().with_shutdown_grace(Duration::from_secs(2)));
        let task = service.task("work()", Inputs::new()).unwrap();
        task.start().await.unwrap();
        worker.expect_launch().await;

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.close().await }
        });
        assert_eq!(worker.next_request().await, Request::Shutdown);

        let second = tokio::spawn({
            let service = service.clone();
            async move { service.close().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        assert_eq!(task.status(), TaskStatus::Running);

        worker.reply(Response::Launched { task: task.id() }).await;
        worker.reply(completion(task.id(), "n", Value::Int(1))).await;
        drop(worker);

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(task.wait_for(None).await, Ok(TaskStatus::Complete));
        assert_eq!(task.outputs().unwrap().get("n"), Some(&Value::Int(1)));
    }
}
