//! Crate-level error type

use crate::config::ConfigError;
use crate::environment::EnvError;
use crate::protocol::ProtocolError;
use crate::service::{ServiceError, TaskError};
use crate::shm::ShmError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Environment(#[from] EnvError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Task has no output named {0:?}")]
    NoSuchOutput(String),

    #[error("Output {0:?} is not an array")]
    NotAnArray(String),
}

pub type Result<T> = std::result::Result<T, Error>;
