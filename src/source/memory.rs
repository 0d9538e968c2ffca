//! Byte-backed tile source.

use crate::array::{self, ReadRegion};
use crate::error::EngineError;
use crate::models::{validate_raw_size, DType, Descriptor};
use crate::operation::{self, HasDType};
use crate::source::{check_region, TileSource};
use crate::tiles::Region;

use bytes::Bytes;
use ndarray::Array5;
// Bring trait into scope to use as_bytes method.
use zerocopy::AsBytes;

/// A dense array held in memory as raw native-endian bytes.
#[derive(Clone, Debug)]
pub struct MemorySource {
    data: Bytes,
    shape: Vec<usize>,
    dtype: DType,
}

impl MemorySource {
    /// Returns a new MemorySource.
    ///
    /// The data is copied into an aligned buffer if it is not already aligned.
    ///
    /// # Arguments
    ///
    /// * `data`: C order element data in native byte order
    /// * `shape`: Shape of the array
    /// * `dtype`: Element type
    pub fn new(data: Bytes, shape: Vec<usize>, dtype: DType) -> Result<Self, EngineError> {
        validate_raw_size(data.len(), &Descriptor::new(shape.clone(), dtype))?;
        Ok(MemorySource {
            data: array::ensure_aligned(data),
            shape,
            dtype,
        })
    }

    /// Build a source from typed values.
    pub fn from_vec<T: HasDType>(values: Vec<T>, shape: Vec<usize>) -> Result<Self, EngineError> {
        Self::new(array::aligned_copy(values.as_bytes()), shape, T::DTYPE)
    }

    /// Raw element data.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl TileSource for MemorySource {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn read_region(&self, region: &Region) -> Result<Array5<f64>, EngineError> {
        check_region(region, &self.shape)?;
        operation::dispatch(
            self.dtype,
            ReadRegion {
                data: &self.data,
                shape: &self.shape,
                region,
            },
        )
    }

    fn read_bytes(&self) -> Result<Bytes, EngineError> {
        Ok(self.data.clone())
    }
}
