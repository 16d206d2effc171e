//! Pure builtin functions of the script language
//!
//! Functions with side effects on the task (`sleep`, `update`, `fail`, ...)
//! live in the executor; everything here only looks at its arguments.

use appose::shm::ShmError;
use appose::{DType, NdArray, Value};

/// A call argument: a plain value or a mapped array
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Value(&'a Value),
    Array(&'a NdArray),
}

/// Result of a builtin call
#[derive(Debug)]
pub enum Produced {
    Value(Value),
    Array(NdArray),
}

impl From<Value> for Produced {
    fn from(value: Value) -> Self {
        Produced::Value(value)
    }
}

impl From<NdArray> for Produced {
    fn from(array: NdArray) -> Self {
        Produced::Array(array)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuiltinError {
    #[error("unknown function {0}")]
    Unknown(String),

    #[error("{function}: {message}")]
    Argument {
        function: &'static str,
        message: String,
    },

    #[error(transparent)]
    Shm(#[from] ShmError),
}

fn argument(function: &'static str, message: impl Into<String>) -> BuiltinError {
    BuiltinError::Argument {
        function,
        message: message.into(),
    }
}

pub fn call(name: &str, args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    match name {
        "rot90" => Ok(rot90(array_arg("rot90", args, 0, 1)?)?.into()),
        "transpose" => Ok(transpose(array_arg("transpose", args, 0, 1)?)?.into()),
        "flip" => Ok(flip(array_arg("flip", args, 0, 1)?)?.into()),
        "copy" => copy(args),
        "scale" => scale(args),
        "add" => add(args),
        "sum" => Ok(Value::Float(sum(array_arg("sum", args, 0, 1)?)?).into()),
        "mean" => mean(array_arg("mean", args, 0, 1)?).map(|m| Value::Float(m).into()),
        "shape" => {
            let array = array_arg("shape", args, 0, 1)?;
            let dims = array.shape().iter().map(|&d| Value::from(d)).collect::<Vec<_>>();
            Ok(Value::List(dims).into())
        }
        "zeros" => zeros(args),
        "len" => len(args),
        "concat" => Ok(Value::String(concat(args)).into()),
        other => Err(BuiltinError::Unknown(other.to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument helpers
// ─────────────────────────────────────────────────────────────────────────────

fn arity(function: &'static str, args: &[Arg<'_>], expected: usize) -> Result<(), BuiltinError> {
    if args.len() != expected {
        return Err(argument(
            function,
            format!("expected {expected} argument(s), got {}", args.len()),
        ));
    }
    Ok(())
}

fn array_arg<'a>(
    function: &'static str,
    args: &[Arg<'a>],
    index: usize,
    expected: usize,
) -> Result<&'a NdArray, BuiltinError> {
    arity(function, args, expected)?;
    match args[index] {
        Arg::Array(array) => Ok(array),
        Arg::Value(value) => Err(argument(function, format!("expected an array, got {value}"))),
    }
}

fn number(function: &'static str, arg: Arg<'_>) -> Result<f64, BuiltinError> {
    match arg {
        Arg::Value(value) => value
            .as_f64()
            .ok_or_else(|| argument(function, format!("expected a number, got {value}"))),
        Arg::Array(_) => Err(argument(function, "expected a number, got an array")),
    }
}

fn matrix(function: &'static str, array: &NdArray) -> Result<(usize, usize), BuiltinError> {
    match array.shape() {
        [rows, cols] => Ok((*rows, *cols)),
        shape => Err(argument(function, format!("expected a 2-D array, got shape {shape:?}"))),
    }
}

/// A numeric result as `Int` when it is integral and both inputs were
fn numeric(value: f64, integral: bool) -> Value {
    if integral && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Array functions
// ─────────────────────────────────────────────────────────────────────────────

/// Copy elements between arrays of the same dtype using `index(dst) -> src`
fn permute(
    source: &NdArray,
    shape: Vec<usize>,
    index: impl Fn(usize) -> usize,
) -> Result<NdArray, BuiltinError> {
    let size = source.dtype().element_size();
    let mut out = NdArray::create(source.dtype(), shape)?;
    let src = source.bytes()?;
    let dst = out.bytes_mut()?;
    for to in 0..dst.len() / size {
        let from = index(to);
        dst[to * size..(to + 1) * size].copy_from_slice(&src[from * size..(from + 1) * size]);
    }
    Ok(out)
}

/// Rotate a `[h, w]` array 90 degrees counter-clockwise into `[w, h]`
pub fn rot90(array: &NdArray) -> Result<NdArray, BuiltinError> {
    let (h, w) = matrix("rot90", array)?;
    // out[i][j] = in[j][w - 1 - i]
    permute(array, vec![w, h], |to| {
        let (i, j) = (to / h, to % h);
        j * w + (w - 1 - i)
    })
}

pub fn transpose(array: &NdArray) -> Result<NdArray, BuiltinError> {
    let (h, w) = matrix("transpose", array)?;
    permute(array, vec![w, h], |to| {
        let (i, j) = (to / h, to % h);
        j * w + i
    })
}

/// Reverse every axis, which reverses the row-major element order
pub fn flip(array: &NdArray) -> Result<NdArray, BuiltinError> {
    let len = array.len();
    permute(array, array.shape().to_vec(), |to| len - 1 - to)
}

/// A new array with the same dtype, shape and contents
pub fn duplicate(array: &NdArray) -> Result<NdArray, BuiltinError> {
    permute(array, array.shape().to_vec(), |to| to)
}

fn copy(args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    arity("copy", args, 1)?;
    match args[0] {
        Arg::Array(array) => Ok(duplicate(array)?.into()),
        Arg::Value(value) => Ok(value.clone().into()),
    }
}

fn map_elements(array: &NdArray, f: impl Fn(f64) -> f64) -> Result<NdArray, BuiltinError> {
    let mut out = NdArray::create(array.dtype(), array.shape().to_vec())?;
    for index in 0..array.len() {
        out.set_f64(index, f(array.get_f64(index)?))?;
    }
    Ok(out)
}

fn scale(args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    arity("scale", args, 2)?;
    let factor = number("scale", args[1])?;
    match args[0] {
        Arg::Array(array) => Ok(map_elements(array, |x| x * factor)?.into()),
        Arg::Value(value) => {
            let x = number("scale", args[0])?;
            let integral = matches!((value, args[1]), (Value::Int(_), Arg::Value(Value::Int(_))));
            Ok(numeric(x * factor, integral).into())
        }
    }
}

fn add(args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    arity("add", args, 2)?;
    match (args[0], args[1]) {
        (Arg::Array(a), Arg::Array(b)) => {
            if a.shape() != b.shape() {
                return Err(argument(
                    "add",
                    format!("shapes {:?} and {:?} differ", a.shape(), b.shape()),
                ));
            }
            let mut out = NdArray::create(a.dtype(), a.shape().to_vec())?;
            for index in 0..a.len() {
                out.set_f64(index, a.get_f64(index)? + b.get_f64(index)?)?;
            }
            Ok(out.into())
        }
        (Arg::Array(array), scalar) | (scalar, Arg::Array(array)) => {
            let k = number("add", scalar)?;
            Ok(map_elements(array, |x| x + k)?.into())
        }
        (Arg::Value(a), Arg::Value(b)) => {
            let sum = number("add", args[0])? + number("add", args[1])?;
            let integral = matches!((a, b), (Value::Int(_), Value::Int(_)));
            Ok(numeric(sum, integral).into())
        }
    }
}

pub fn sum(array: &NdArray) -> Result<f64, BuiltinError> {
    (0..array.len()).try_fold(0.0, |acc, index| Ok(acc + array.get_f64(index)?))
}

pub fn mean(array: &NdArray) -> Result<f64, BuiltinError> {
    if array.is_empty() {
        return Err(argument("mean", "mean of an empty array"));
    }
    Ok(sum(array)? / array.len() as f64)
}

fn zeros(args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    let Some((first, dims)) = args.split_first() else {
        return Err(argument("zeros", "expected a dtype and dimensions"));
    };
    let dtype = match first {
        Arg::Value(Value::String(name)) => name
            .parse::<DType>()
            .map_err(|_| argument("zeros", format!("unknown dtype {name:?}")))?,
        _ => return Err(argument("zeros", "first argument must be a dtype name")),
    };
    let shape = dims
        .iter()
        .map(|dim| match dim {
            Arg::Value(Value::Int(d)) if *d >= 0 => Ok(*d as usize),
            _ => Err(argument("zeros", "dimensions must be non-negative integers")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NdArray::create(dtype, shape)?.into())
}

fn len(args: &[Arg<'_>]) -> Result<Produced, BuiltinError> {
    arity("len", args, 1)?;
    let len = match args[0] {
        Arg::Array(array) => array.len(),
        Arg::Value(Value::String(s)) => s.chars().count(),
        Arg::Value(Value::List(items)) => items.len(),
        Arg::Value(Value::Map(map)) => map.len(),
        Arg::Value(other) => return Err(argument("len", format!("{other} has no length"))),
    };
    Ok(Value::from(len).into())
}

fn concat(args: &[Arg<'_>]) -> String {
    args.iter()
        .map(|arg| match arg {
            Arg::Value(value) => value.to_string(),
            Arg::Array(array) => format!("ndarray({}, {:?})", array.dtype(), array.shape()),
        })
        .collect()
}
