//! Task execution
//!
//! Each launched task runs [`run_task`] on its own tokio task. Arrays the
//! script creates live in a per-task arena: those published as outputs are
//! disowned so they outlive the worker's mapping, everything else is
//! unlinked when the arena drops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use appose::protocol::{FrameWriter, ProtocolError, Response, TaskId};
use appose::shm::ShmError;
use appose::{NdArray, Value};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, warn};

use crate::builtins::{self, Arg, BuiltinError, Produced};
use crate::script::{self, Expr, Stmt, SyntaxError};

/// Functions that act on the task rather than compute a value
const EFFECTS: [&str; 5] = ["sleep", "update", "fail", "crash", "garbage"];

// ─────────────────────────────────────────────────────────────────────────────
// Outbox
// ─────────────────────────────────────────────────────────────────────────────

/// Shared writer for frames going back to the parent
pub struct Outbox {
    writer: Mutex<FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl Outbox {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(FrameWriter::new(Box::new(writer))),
        }
    }

    pub async fn send(&self, response: &Response) -> Result<(), ProtocolError> {
        self.writer.lock().await.send(response).await
    }

    /// Write a frame body verbatim
    pub async fn send_raw(&self, body: &[u8]) -> Result<(), ProtocolError> {
        self.writer.lock().await.write_frame(body).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StatementError {
    #[error("undefined variable {0}")]
    Undefined(String),

    #[error("{0}() may only be called as a whole statement")]
    NestedEffect(String),

    #[error("{function}: {message}")]
    Argument {
        function: &'static str,
        message: String,
    },

    #[error(transparent)]
    Builtin(#[from] BuiltinError),

    #[error("{0}")]
    Failed(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Disconnected(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("input {name}: {source}")]
    Input {
        name: String,
        #[source]
        source: ShmError,
    },

    #[error("line {line}: {source}")]
    Statement {
        line: usize,
        #[source]
        source: StatementError,
    },

    #[error("output {name}: {source}")]
    Output {
        name: String,
        #[source]
        source: BuiltinError,
    },

    #[error("output {name} is {value}, which has no JSON form")]
    NotFinite { name: String, value: f64 },

    /// Raised by `fail(message)`; carries the message unchanged
    #[error("{0}")]
    Failed(String),

    #[error("canceled")]
    Canceled,

    #[error("parent disconnected: {0}")]
    Disconnected(ProtocolError),
}

impl ScriptError {
    fn at(line: usize, source: StatementError) -> Self {
        match source {
            StatementError::Failed(message) => ScriptError::Failed(message),
            StatementError::Canceled => ScriptError::Canceled,
            StatementError::Disconnected(e) => ScriptError::Disconnected(e),
            source => ScriptError::Statement { line, source },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Run one task to its terminal frame
pub async fn run_task(
    task: TaskId,
    script: String,
    inputs: BTreeMap<String, Value>,
    outbox: Arc<Outbox>,
    cancel: watch::Receiver<bool>,
) {
    if let Err(e) = outbox.send(&Response::Launched { task }).await {
        warn!("Task {} could not report launch: {}", task, e);
        return;
    }
    debug!("Task {} launched", task);

    let response = match execute(task, &script, inputs, &outbox, cancel).await {
        Ok(outputs) => Response::Completion { task, outputs },
        Err(ScriptError::Canceled) => {
            debug!("Task {} canceled", task);
            Response::Canceled { task }
        }
        Err(ScriptError::Disconnected(e)) => {
            warn!("Task {} abandoned: {}", task, e);
            return;
        }
        Err(e) => {
            debug!("Task {} failed: {}", task, e);
            Response::Failure {
                task,
                error: e.to_string(),
            }
        }
    };

    if let Err(e) = outbox.send(&response).await {
        warn!("Task {} could not report {}: {}", task, response.kind(), e);
        if let Response::Completion { outputs, .. } = &response {
            release(outputs);
        }
    }
}

/// Unlink output arrays that never reached the parent
fn release(outputs: &BTreeMap<String, Value>) {
    let names: BTreeSet<&str> = outputs
        .values()
        .flat_map(Value::ndarray_refs)
        .map(|reference| reference.name.as_str())
        .collect();
    for name in names {
        if let Err(e) = appose::shm::unlink_name(name) {
            warn!("Failed to release output array {}: {}", name, e);
        }
    }
}

async fn execute(
    task: TaskId,
    source: &str,
    inputs: BTreeMap<String, Value>,
    outbox: &Outbox,
    cancel: watch::Receiver<bool>,
) -> Result<BTreeMap<String, Value>, ScriptError> {
    let lines = script::parse(source)?;
    let mut context = TaskContext::new(task, outbox, cancel);
    context.bind_inputs(inputs)?;

    for line in &lines {
        if context.is_canceled() {
            return Err(ScriptError::Canceled);
        }
        context
            .statement(&line.stmt)
            .await
            .map_err(|e| ScriptError::at(line.number, e))?;
    }
    context.publish()
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Local {
    Value(Value),
    /// Index into the array arena
    Array(usize),
}

struct TaskContext<'a> {
    task: TaskId,
    arrays: Vec<NdArray>,
    vars: HashMap<String, Local>,
    outputs: BTreeMap<String, Local>,
    outbox: &'a Outbox,
    cancel: watch::Receiver<bool>,
}

impl<'a> TaskContext<'a> {
    fn new(task: TaskId, outbox: &'a Outbox, cancel: watch::Receiver<bool>) -> Self {
        Self {
            task,
            arrays: Vec::new(),
            vars: HashMap::new(),
            outputs: BTreeMap::new(),
            outbox,
            cancel,
        }
    }

    fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Attach input arrays without taking ownership; other values bind as-is
    fn bind_inputs(&mut self, inputs: BTreeMap<String, Value>) -> Result<(), ScriptError> {
        for (name, value) in inputs {
            let local = match value {
                Value::NdArray(reference) => {
                    let array = NdArray::attach(&reference).map_err(|source| ScriptError::Input {
                        name: name.clone(),
                        source,
                    })?;
                    self.push(array)
                }
                value => Local::Value(value),
            };
            self.vars.insert(name, local);
        }
        Ok(())
    }

    fn push(&mut self, array: NdArray) -> Local {
        self.arrays.push(array);
        Local::Array(self.arrays.len() - 1)
    }

    fn lookup(&self, name: &str) -> Result<Local, StatementError> {
        self.vars
            .get(name)
            .cloned()
            .ok_or_else(|| StatementError::Undefined(name.to_string()))
    }

    async fn statement(&mut self, stmt: &Stmt) -> Result<(), StatementError> {
        match stmt {
            Stmt::Assign { name, expr } => {
                let local = self.evaluate(expr).await?;
                self.vars.insert(name.clone(), local);
            }
            Stmt::Output { name, expr } => {
                let local = match expr {
                    Some(expr) => {
                        let local = self.evaluate(expr).await?;
                        self.vars.insert(name.clone(), local.clone());
                        local
                    }
                    None => self.lookup(name)?,
                };
                self.outputs.insert(name.clone(), local);
            }
            Stmt::Expr(expr) => {
                self.evaluate(expr).await?;
            }
        }
        Ok(())
    }

    async fn evaluate(&mut self, expr: &Expr) -> Result<Local, StatementError> {
        match expr {
            Expr::Call { name, args } if EFFECTS.contains(&name.as_str()) => {
                let args = self.eval_args(args)?;
                self.effect(name, &args).await.map(Local::Value)
            }
            _ => self.eval(expr),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Local, StatementError> {
        Ok(match expr {
            Expr::Null => Local::Value(Value::Null),
            Expr::Bool(b) => Local::Value(Value::Bool(*b)),
            Expr::Int(i) => Local::Value(Value::Int(*i)),
            Expr::Float(x) => Local::Value(Value::Float(*x)),
            Expr::Str(s) => Local::Value(Value::String(s.clone())),
            Expr::Var(name) => self.lookup(name)?,
            Expr::Call { name, .. } if EFFECTS.contains(&name.as_str()) => {
                return Err(StatementError::NestedEffect(name.clone()));
            }
            Expr::Call { name, args } => {
                let args = self.eval_args(args)?;
                let produced = {
                    let borrowed: Vec<Arg<'_>> = args
                        .iter()
                        .map(|local| match local {
                            Local::Value(value) => Arg::Value(value),
                            Local::Array(index) => Arg::Array(&self.arrays[*index]),
                        })
                        .collect();
                    builtins::call(name, &borrowed)?
                };
                match produced {
                    Produced::Value(value) => Local::Value(value),
                    Produced::Array(array) => self.push(array),
                }
            }
        })
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Local>, StatementError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    // ── Effects ─────────────────────────────────────────────────────────────

    async fn effect(&mut self, name: &str, args: &[Local]) -> Result<Value, StatementError> {
        match name {
            "sleep" => {
                let ms = self.count("sleep", args, 0)?.unwrap_or(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Value::Null),
                    _ = canceled(&mut self.cancel) => Err(StatementError::Canceled),
                }
            }
            "update" => {
                let message = match args.first() {
                    Some(Local::Value(value)) => value.to_string(),
                    _ => return Err(argument("update", "expected a message")),
                };
                let current = self.count("update", args, 1)?;
                let maximum = self.count("update", args, 2)?;
                self.outbox
                    .send(&Response::Update {
                        task: self.task,
                        message: Some(message),
                        current,
                        maximum,
                    })
                    .await?;
                Ok(Value::Null)
            }
            "fail" => {
                let message = match args.first() {
                    Some(Local::Value(value)) => value.to_string(),
                    _ => "task failed".to_string(),
                };
                Err(StatementError::Failed(message))
            }
            "crash" => {
                let code = self.count("crash", args, 0)?.unwrap_or(1);
                error!("Task {} requested a crash with exit code {}", self.task, code);
                std::process::exit(i32::try_from(code).unwrap_or(1));
            }
            "garbage" => {
                warn!("Task {} writing a malformed frame", self.task);
                self.outbox.send_raw(b"this is not json").await?;
                Ok(Value::Null)
            }
            other => Err(StatementError::Builtin(BuiltinError::Unknown(other.to_string()))),
        }
    }

    /// Optional non-negative integer argument at `index`
    fn count(
        &self,
        function: &'static str,
        args: &[Local],
        index: usize,
    ) -> Result<Option<u64>, StatementError> {
        match args.get(index) {
            None => Ok(None),
            Some(Local::Value(Value::Int(n))) if *n >= 0 => Ok(Some(*n as u64)),
            Some(_) => Err(argument(
                function,
                format!("argument {} must be a non-negative integer", index + 1),
            )),
        }
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Turn published locals into output values, handing arrays to the parent.
    ///
    /// Nothing is disowned until every output is ready, so a failure leaves
    /// all arrays in the arena to be unlinked.
    fn publish(&mut self) -> Result<BTreeMap<String, Value>, ScriptError> {
        let outputs = std::mem::take(&mut self.outputs);
        let mut ready = Vec::with_capacity(outputs.len());
        for (name, local) in outputs {
            let local = match local {
                Local::Value(value) => match value.non_finite() {
                    Some(value) => return Err(ScriptError::NotFinite { name, value }),
                    None => Local::Value(value),
                },
                // Inputs belong to the parent; publish a fresh copy instead
                Local::Array(index) if !self.arrays[index].is_owner() => {
                    let copy = builtins::duplicate(&self.arrays[index]).map_err(|source| {
                        ScriptError::Output {
                            name: name.clone(),
                            source,
                        }
                    })?;
                    self.push(copy)
                }
                local => local,
            };
            ready.push((name, local));
        }

        let mut values = BTreeMap::new();
        for (name, local) in ready {
            let value = match local {
                Local::Value(value) => value,
                Local::Array(index) => {
                    let array = &mut self.arrays[index];
                    array.disown();
                    Value::NdArray(array.reference())
                }
            };
            values.insert(name, value);
        }
        Ok(values)
    }
}

fn argument(function: &'static str, message: impl Into<String>) -> StatementError {
    StatementError::Argument {
        function,
        message: message.into(),
    }
}

/// Resolves once cancellation is requested; never resolves if it cannot be
async fn canceled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
