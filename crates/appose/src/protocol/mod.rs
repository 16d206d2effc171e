//! Parent/worker message protocol
//!
//! Every frame is one JSON object tagged by `"kind"`.
//!
//! Parent → worker:
//! - `launch`: start a task with a script and named inputs
//! - `cancel`: best-effort request to abort a running task
//! - `shutdown`: exit once in-flight tasks are wound down
//!
//! Worker → parent:
//! - `launched`: the worker accepted a launch
//! - `update`: progress report, the task stays running
//! - `completion` / `failure` / `canceled`: terminal frames
//! - `crash`: the worker hit a fatal error outside any single task

mod frame;

pub use frame::{DEFAULT_MAX_FRAME_LEN, FrameReader, FrameWriter};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a task, unique within its service
pub type TaskId = uuid::Uuid;

/// Message sent from the parent to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Launch {
        task: TaskId,
        script: String,
        #[serde(default)]
        inputs: BTreeMap<String, Value>,
    },
    Cancel {
        task: TaskId,
    },
    Shutdown,
}

/// Message sent from the worker to the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Launched {
        task: TaskId,
    },
    Update {
        task: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<u64>,
    },
    Completion {
        task: TaskId,
        #[serde(default)]
        outputs: BTreeMap<String, Value>,
    },
    Failure {
        task: TaskId,
        error: String,
    },
    Canceled {
        task: TaskId,
    },
    Crash {
        error: String,
    },
}

impl Response {
    /// The task this frame is addressed to, if any
    pub fn task(&self) -> Option<TaskId> {
        match self {
            Response::Launched { task }
            | Response::Update { task, .. }
            | Response::Completion { task, .. }
            | Response::Failure { task, .. }
            | Response::Canceled { task } => Some(*task),
            Response::Crash { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Response::Launched { .. } => "launched",
            Response::Update { .. } => "update",
            Response::Completion { .. } => "completion",
            Response::Failure { .. } => "failure",
            Response::Canceled { .. } => "canceled",
            Response::Crash { .. } => "crash",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Response::Completion { .. } | Response::Failure { .. } | Response::Canceled { .. }
        )
    }
}

/// Errors reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Stream ended inside a frame")]
    Truncated,

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the error means the peer went away rather than sent garbage
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{DType, NdArrayRef};

    #[test]
    fn launch_wire_format() {
        let task = uuid::Uuid::nil();
        let request = Request::Launch {
            task,
            script: "output rotated = rot90(image)".into(),
            inputs: BTreeMap::from([(
                "image".to_string(),
                Value::NdArray(NdArrayRef::new("/appose-img", DType::Float64, vec![4, 4])),
            )]),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "launch");
        assert_eq!(json["task"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["inputs"]["image"]["appose_type"], "ndarray");
        assert_eq!(json["inputs"]["image"]["shape"], serde_json::json!([4, 4]));
    }

    #[test]
    fn responses_parse_with_optional_fields_missing() {
        let task = uuid::Uuid::new_v4();
        let update: Response =
            serde_json::from_value(serde_json::json!({"kind": "update", "task": task})).unwrap();
        assert_eq!(
            update,
            Response::Update {
                task,
                message: None,
                current: None,
                maximum: None
            }
        );

        let completion: Response =
            serde_json::from_value(serde_json::json!({"kind": "completion", "task": task}))
                .unwrap();
        assert!(completion.is_terminal());
        assert_eq!(completion.task(), Some(task));
    }

    #[test]
    fn unknown_kinds_do_not_parse() {
        let result =
            serde_json::from_value::<Response>(serde_json::json!({"kind": "lunch", "task": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_is_a_bare_kind() {
        let json = serde_json::to_value(&Request::Shutdown).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "shutdown"}));
    }
}
