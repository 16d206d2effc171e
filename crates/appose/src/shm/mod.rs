//! Shared Memory Arrays
//!
//! N-dimensional numeric arrays whose bytes live in named shared memory, so
//! the parent and a worker process can both map them without copying.
//!
//! - [`SharedMemory`]: the raw named segment
//! - [`NdArray`]: a segment interpreted as a typed, row-major, shaped array
//! - [`NdArrayRef`]: the serializable reference sent in task frames

mod dtype;
mod ndarray;
mod segment;

pub use dtype::{DType, Element, byte_len, element_count};
pub use ndarray::{NdArray, NdArrayRef};
pub use segment::{NAME_PREFIX, SharedMemory, unlink_name};

/// Errors from creating, attaching, or viewing shared memory
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("Shared memory not found: {0}")]
    NotFound(String),

    #[error("Shared memory already exists: {0}")]
    AlreadyExists(String),

    #[error("Shared memory {name} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid shared memory name: {0:?}")]
    InvalidName(String),

    #[error("Shared memory {0} is closed")]
    Closed(String),

    #[error("Array has element type {actual}, requested {requested}")]
    TypeMismatch { actual: DType, requested: DType },

    #[error("Unknown element type: {0}")]
    UnknownDType(String),

    #[error("Shape {0:?} is too large")]
    ShapeOverflow(Vec<usize>),

    #[error("Index {index} out of bounds for array of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("Expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("{op} failed for shared memory {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShmError {
    pub(crate) fn os(op: &'static str, name: &str, source: std::io::Error) -> Self {
        ShmError::Os {
            op,
            name: name.to_string(),
            source,
        }
    }
}
