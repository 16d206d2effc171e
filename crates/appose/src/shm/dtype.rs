//! Element types for shared-memory arrays

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ShmError;

/// Fixed-width numeric element kind of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl DType {
    pub const ALL: [DType; 10] = [
        DType::Int8,
        DType::Uint8,
        DType::Int16,
        DType::Uint16,
        DType::Int32,
        DType::Uint32,
        DType::Int64,
        DType::Uint64,
        DType::Float32,
        DType::Float64,
    ];

    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        match self {
            DType::Int8 | DType::Uint8 => 1,
            DType::Int16 | DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Uint64 | DType::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Uint8 => "uint8",
            DType::Int16 => "int16",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Int64 => "int64",
            DType::Uint64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = ShmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::ALL
            .into_iter()
            .find(|dtype| dtype.as_str() == s)
            .ok_or_else(|| ShmError::UnknownDType(s.to_string()))
    }
}

/// Number of elements described by a shape.
///
/// An empty shape is a scalar (one element). Returns `None` on overflow.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
}

/// Exact byte length of an array with the given type and shape
pub fn byte_len(dtype: DType, shape: &[usize]) -> Result<usize, ShmError> {
    element_count(shape)
        .and_then(|count| count.checked_mul(dtype.element_size()))
        .ok_or_else(|| ShmError::ShapeOverflow(shape.to_vec()))
}

/// A Rust primitive that can be viewed inside a shared-memory array
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_dtype_name() {
        for dtype in DType::ALL {
            assert_eq!(dtype.as_str().parse::<DType>().unwrap(), dtype);
        }
        assert!(matches!("complex128".parse::<DType>(), Err(ShmError::UnknownDType(_))));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DType::Float64).unwrap(), "\"float64\"");
        let parsed: DType = serde_json::from_str("\"uint16\"").unwrap();
        assert_eq!(parsed, DType::Uint16);
    }

    #[test]
    fn byte_len_follows_shape() {
        assert_eq!(byte_len(DType::Float64, &[4, 4]).unwrap(), 128);
        assert_eq!(byte_len(DType::Uint8, &[]).unwrap(), 1);
        assert_eq!(byte_len(DType::Int32, &[3, 0, 7]).unwrap(), 0);
        assert!(matches!(
            byte_len(DType::Float64, &[usize::MAX, 2]),
            Err(ShmError::ShapeOverflow(_))
        ));
    }
}
