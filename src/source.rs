//! Storage backing an image array.
//!
//! A [TileSource] hands out regions of a 5D array on demand. Implementations never need to hold
//! the whole array in memory, although [MemorySource] does.

pub mod memory;
pub mod tiff;

pub use self::memory::MemorySource;
pub use self::tiff::TiffSource;

use crate::error::EngineError;
use crate::models::{AxisName, DType};
use crate::tiles::{Region, Shape5};

use bytes::Bytes;
use ndarray::Array5;

/// Random access to regions of a 5D (T, Z, Y, X, C) array.
pub trait TileSource: Send + Sync + std::fmt::Debug {
    /// Shape of the whole array. Has five entries for any source accepted by
    /// [ImageArray](crate::image::ImageArray).
    fn shape(&self) -> &[usize];

    /// Element type of the stored data.
    fn dtype(&self) -> DType;

    /// Read `region` and convert its values to `f64`.
    fn read_region(&self, region: &Region) -> Result<Array5<f64>, EngineError>;

    /// Read the whole array as C order bytes in native byte order.
    fn read_bytes(&self) -> Result<Bytes, EngineError>;
}

/// Check that `region` lies within `shape`, naming the first offending axis otherwise.
pub(crate) fn check_region(region: &Region, shape: &[usize]) -> Result<Shape5, EngineError> {
    let shape: Shape5 = shape.try_into().map_err(|_| EngineError::Shape {
        axes: shape.len(),
        shape: shape.to_vec(),
    })?;
    for axis in AxisName::ALL {
        let i = axis.index();
        if region.start[i] + region.extent[i] > shape[i] {
            return Err(EngineError::IndexOutOfRange {
                axis,
                index: region.start[i] + region.extent[i].max(1) - 1,
                extent: shape[i],
            });
        }
    }
    Ok(shape)
}
