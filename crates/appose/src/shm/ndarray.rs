//! Typed, shaped views over shared memory

use serde::{Deserialize, Serialize};

use super::dtype::{DType, Element, byte_len, element_count};
use super::segment::SharedMemory;
use super::ShmError;

/// Reference to a shared-memory array, as carried in task frames
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NdArrayRef {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl NdArrayRef {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn byte_len(&self) -> Result<usize, ShmError> {
        byte_len(self.dtype, &self.shape)
    }
}

/// An N-dimensional array stored in shared memory.
///
/// Layout is row-major in native byte order. The backing segment is always
/// exactly `dtype.element_size() * product(shape)` bytes.
#[derive(Debug)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    shm: SharedMemory,
}

impl NdArray {
    /// Allocate a zero-filled array under a generated name
    pub fn create(dtype: DType, shape: impl Into<Vec<usize>>) -> Result<Self, ShmError> {
        let shape = shape.into();
        let size = byte_len(dtype, &shape)?;
        let shm = SharedMemory::create(None, size)?;
        Ok(Self { dtype, shape, shm })
    }

    /// Allocate a zero-filled array under an explicit name
    pub fn create_named(
        name: &str,
        dtype: DType,
        shape: impl Into<Vec<usize>>,
    ) -> Result<Self, ShmError> {
        let shape = shape.into();
        let size = byte_len(dtype, &shape)?;
        let shm = SharedMemory::create(Some(name), size)?;
        Ok(Self { dtype, shape, shm })
    }

    /// Allocate an array and copy `data` into it
    pub fn from_slice<T: Element>(shape: impl Into<Vec<usize>>, data: &[T]) -> Result<Self, ShmError> {
        let mut array = Self::create(T::DTYPE, shape)?;
        array.copy_from(data)?;
        Ok(array)
    }

    /// Map an array created by another process (or another handle)
    pub fn attach(reference: &NdArrayRef) -> Result<Self, ShmError> {
        let size = reference.byte_len()?;
        let shm = SharedMemory::attach(&reference.name, size)?;
        Ok(Self {
            dtype: reference.dtype,
            shape: reference.shape.clone(),
            shm,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        element_count(&self.shape).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.shm.size()
    }

    pub fn reference(&self) -> NdArrayRef {
        NdArrayRef::new(self.shm.name(), self.dtype, self.shape.clone())
    }

    pub fn shm(&self) -> &SharedMemory {
        &self.shm
    }

    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    pub fn disown(&mut self) {
        self.shm.disown();
    }

    pub fn adopt(&mut self) {
        self.shm.adopt();
    }

    pub fn close(&mut self) {
        self.shm.close();
    }

    pub fn unlink(&mut self) -> Result<(), ShmError> {
        self.shm.unlink()
    }

    pub fn bytes(&self) -> Result<&[u8], ShmError> {
        self.shm.as_bytes()
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8], ShmError> {
        self.shm.as_bytes_mut()
    }

    /// View the elements as `&[T]` without copying
    pub fn as_slice<T: Element>(&self) -> Result<&[T], ShmError> {
        self.check_type::<T>()?;
        let bytes = self.shm.as_bytes()?;
        if bytes.is_empty() {
            return Ok(&[]);
        }
        // SAFETY: the mapping is page aligned and sized for `len` elements of T
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), self.len()) })
    }

    /// View the elements as `&mut [T]` without copying
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], ShmError> {
        self.check_type::<T>()?;
        let len = self.len();
        let bytes = self.shm.as_bytes_mut()?;
        if bytes.is_empty() {
            return Ok(&mut []);
        }
        // SAFETY: see `as_slice`
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), len) })
    }

    /// Copy a host buffer of the same length into the array
    pub fn copy_from<T: Element>(&mut self, data: &[T]) -> Result<(), ShmError> {
        let target = self.as_mut_slice::<T>()?;
        if target.len() != data.len() {
            return Err(ShmError::LengthMismatch {
                expected: target.len(),
                actual: data.len(),
            });
        }
        target.copy_from_slice(data);
        Ok(())
    }

    /// Read element `index` (row-major) converted to f64
    pub fn get_f64(&self, index: usize) -> Result<f64, ShmError> {
        self.check_index(index)?;
        macro_rules! read {
            ($ty:ty) => {
                self.as_slice::<$ty>()?[index].to_f64()
            };
        }
        Ok(match self.dtype {
            DType::Int8 => read!(i8),
            DType::Uint8 => read!(u8),
            DType::Int16 => read!(i16),
            DType::Uint16 => read!(u16),
            DType::Int32 => read!(i32),
            DType::Uint32 => read!(u32),
            DType::Int64 => read!(i64),
            DType::Uint64 => read!(u64),
            DType::Float32 => read!(f32),
            DType::Float64 => read!(f64),
        })
    }

    /// Write element `index` (row-major), converting from f64 with `as`
    /// semantics
    pub fn set_f64(&mut self, index: usize, value: f64) -> Result<(), ShmError> {
        self.check_index(index)?;
        macro_rules! write {
            ($ty:ty) => {
                self.as_mut_slice::<$ty>()?[index] = <$ty as Element>::from_f64(value)
            };
        }
        match self.dtype {
            DType::Int8 => write!(i8),
            DType::Uint8 => write!(u8),
            DType::Int16 => write!(i16),
            DType::Uint16 => write!(u16),
            DType::Int32 => write!(i32),
            DType::Uint32 => write!(u32),
            DType::Int64 => write!(i64),
            DType::Uint64 => write!(u64),
            DType::Float32 => write!(f32),
            DType::Float64 => write!(f64),
        }
        Ok(())
    }

    fn check_type<T: Element>(&self) -> Result<(), ShmError> {
        if T::DTYPE != self.dtype {
            return Err(ShmError::TypeMismatch {
                actual: self.dtype,
                requested: T::DTYPE,
            });
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), ShmError> {
        let len = self.len();
        if index >= len {
            return Err(ShmError::OutOfBounds { index, len });
        }
        Ok(())
    }
}
