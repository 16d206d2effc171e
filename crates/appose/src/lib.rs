//! Appose - cross-process task execution with shared-memory arrays
//!
//! This crate provides the parent side of a worker protocol:
//! - Shared memory N-dimensional arrays both processes map without copying
//! - A length-prefixed JSON frame protocol over the worker's stdio
//! - Services that supervise one worker process and multiplex tasks over it
//! - Environments resolved from declarative documents, provisioned once

// Shared memory arrays
pub mod shm;

// Task inputs and outputs
pub mod value;

// Wire protocol
pub mod protocol;

// Worker supervision and tasks
pub mod service;

// Environment resolution
pub mod environment;

// Layered configuration
pub mod config;

pub mod error;

pub use config::ApposeConfig;
pub use environment::{
    Environment, EnvironmentResolver, EnvironmentSpec, ExistingInterpreter, Provisioner, RestartPolicy,
};
pub use error::{Error, Result};
pub use service::{
    Inputs, Outputs, Service, ServiceConfig, Task, TaskError, TaskEvent, TaskEventKind, TaskStatus, WorkerCommand,
};
pub use shm::{DType, NdArray, NdArrayRef};
pub use value::Value;
