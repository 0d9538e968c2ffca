//! Functions and utilities for working with [ndarray] objects built on raw bytes.

use crate::error::EngineError;
use crate::operation::{Element, TypedOperation};
use crate::tiles::Region;

use bytes::Bytes;
use ndarray::prelude::*;

/// Alignment of buffers handed to [from_bytes], large enough for any supported element type.
const BUFFER_ALIGNMENT: usize = 8;

/// Convert from bytes to `&[T]`.
///
/// Zerocopy provides a mechanism for converting between types.
/// Correct alignment of the data is necessary.
///
/// # Arguments
///
/// * `data`: Bytes containing data to convert.
pub fn from_bytes<T: zerocopy::FromBytes>(data: &[u8]) -> Result<&[T], EngineError> {
    // An empty buffer may be a dangling, unaligned pointer.
    if data.is_empty() {
        return Ok(&[]);
    }
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(data).ok_or(
        EngineError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice())
}

/// Copy data into a new 8-byte aligned buffer.
///
/// Buffers read from files or handed over by a record store have no alignment guarantees. In
/// order to reinterpret the data as an array of numbers with a higher alignment than 1, the data
/// must live in a buffer with a suitable alignment.
pub fn aligned_copy(data: &[u8]) -> Bytes {
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len());
    buf.extend_from_slice(data);
    buf.into()
}

/// Return `data` unchanged if it is already aligned, or an aligned copy otherwise.
pub fn ensure_aligned(data: Bytes) -> Bytes {
    if data.as_ptr().align_offset(BUFFER_ALIGNMENT) == 0 {
        data
    } else {
        aligned_copy(&data)
    }
}

/// Reverse the byte order of every element in place.
///
/// # Arguments
///
/// * `data`: Raw element data
/// * `element_size`: Size of one element in bytes
pub fn reverse_byte_order(data: &mut [u8], element_size: usize) {
    if element_size > 1 {
        data.chunks_exact_mut(element_size)
            .for_each(|element| element.reverse());
    }
}

/// Build an [ndarray::ArrayView](ndarray::ArrayView) over raw data.
///
/// The resulting array borrows `data`, so no copying takes place.
///
/// # Arguments
///
/// * `data`: Raw data for the array. Must be at least as aligned as an instance of `T`.
/// * `shape`: Shape of the array
pub fn build_array<'a, T>(
    data: &'a [u8],
    shape: &[usize],
) -> Result<ArrayViewD<'a, T>, EngineError>
where
    T: zerocopy::FromBytes,
{
    let data = from_bytes::<T>(data)?;
    ArrayViewD::<T>::from_shape(shape, data).map_err(EngineError::NdShape)
}

/// Reads a region of a 5D array stored as raw bytes and converts it to `f64`.
pub struct ReadRegion<'a> {
    /// Raw data of the whole array
    pub data: &'a [u8],
    /// Shape of the whole array
    pub shape: &'a [usize],
    /// Region to read
    pub region: &'a Region,
}

impl TypedOperation for ReadRegion<'_> {
    type Output = Array5<f64>;

    fn execute_t<T: Element>(self) -> Result<Self::Output, EngineError> {
        let array = build_array::<T>(self.data, self.shape)?.into_dimensionality::<Ix5>()?;
        Ok(self.region.slice(array).mapv(|value| value.as_()))
    }
}

/// Convert an array into nested JSON arrays, outermost axis first.
///
/// A zero-dimensional array becomes a bare number.
pub fn to_nested<A, D>(array: ArrayView<A, D>) -> serde_json::Value
where
    A: Clone + Into<serde_json::Value>,
    D: Dimension,
{
    fn nest<A: Clone + Into<serde_json::Value>>(view: ArrayViewD<A>) -> serde_json::Value {
        if view.ndim() == 0 {
            return view
                .iter()
                .next()
                .cloned()
                .map_or(serde_json::Value::Null, Into::into);
        }
        serde_json::Value::Array(view.outer_iter().map(nest).collect())
    }
    nest(array.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::DType;
    use crate::operation::dispatch;
    use zerocopy::AsBytes;

    #[test]
    fn from_bytes_u16() {
        assert_eq!(
            [0x0201_u16, 0x0403],
            from_bytes::<u16>(aligned_copy(&[1, 2, 3, 4]).as_ref()).unwrap()
        );
    }

    #[test]
    fn from_bytes_u32() {
        assert_eq!(
            [0x04030201_u32],
            from_bytes::<u32>(aligned_copy(&[1, 2, 3, 4]).as_ref()).unwrap()
        );
    }

    #[test]
    fn from_bytes_f64() {
        assert_eq!(
            [5.447603722011605e-270_f64],
            from_bytes::<f64>(aligned_copy(&[1, 2, 3, 4, 5, 6, 7, 8]).as_ref()).unwrap()
        );
    }

    fn assert_from_bytes_error<T: std::fmt::Debug>(result: Result<T, EngineError>) {
        match result.unwrap_err() {
            EngineError::FromBytes { type_name: _ } => (),
            _ => panic!("expected from_bytes to fail"),
        };
    }

    #[test]
    fn from_bytes_u32_too_small() {
        assert_from_bytes_error(from_bytes::<u32>(aligned_copy(&[1, 2, 3]).as_ref()))
    }

    #[test]
    fn from_bytes_u32_unaligned() {
        let data = aligned_copy(&[1, 2, 3, 4, 5]);
        assert_from_bytes_error(from_bytes::<u32>(&data[1..]))
    }

    #[test]
    fn aligned_copy_is_aligned() {
        let data = aligned_copy(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(0, data.as_ptr().align_offset(8));
        assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8, 9], data.as_ref());
    }

    #[test]
    fn ensure_aligned_unaligned_input() {
        let data = aligned_copy(&[0, 1, 2, 3, 4]).slice(1..);
        let aligned = ensure_aligned(data.clone());
        assert_eq!(0, aligned.as_ptr().align_offset(8));
        assert_eq!(data, aligned);
    }

    #[test]
    fn reverse_byte_order_u32() {
        let mut data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        reverse_byte_order(&mut data, 4);
        assert_eq!(vec![4, 3, 2, 1, 8, 7, 6, 5], data);
        reverse_byte_order(&mut data, 1);
        assert_eq!(vec![4, 3, 2, 1, 8, 7, 6, 5], data);
    }

    #[test]
    fn build_array_2d() {
        let values = [1.0_f32, 2.1, 3.2, 4.3, 5.4, 6.5];
        let data = aligned_copy(values.as_bytes());
        let array = build_array::<f32>(&data, &[2, 3]).unwrap();
        assert_eq!(array![[1.0, 2.1, 3.2], [4.3, 5.4, 6.5]].into_dyn(), array);
    }

    #[test]
    fn build_array_shape_err() {
        let data = aligned_copy([1_u8, 2, 3].as_bytes());
        match build_array::<u8>(&data, &[4]).unwrap_err() {
            EngineError::NdShape(err) => {
                assert_eq!(ndarray::ErrorKind::OutOfBounds, err.kind())
            }
            _ => panic!("Expected out of bounds error"),
        }
    }

    #[test]
    fn read_region_u16() {
        let values: Vec<u16> = (0..16).collect();
        let data = aligned_copy(values.as_bytes());
        let region = Region::new([0, 0, 1, 2, 0], [1, 1, 2, 2, 1]);
        let result = dispatch(
            DType::Uint16,
            ReadRegion {
                data: &data,
                shape: &[1, 1, 4, 4, 1],
                region: &region,
            },
        )
        .unwrap();
        assert_eq!([1, 1, 2, 2, 1], result.shape());
        assert_eq!(
            vec![6.0, 7.0, 10.0, 11.0],
            result.iter().copied().collect::<Vec<f64>>()
        );
    }

    #[test]
    fn read_region_not_5d() {
        let values: Vec<u8> = (0..4).collect();
        let data = aligned_copy(&values);
        let region = Region::new([0; 5], [1; 5]);
        let err = dispatch(
            DType::Uint8,
            ReadRegion {
                data: &data,
                shape: &[2, 2],
                region: &region,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NdShape(_)));
    }

    #[test]
    fn to_nested_2d() {
        let labels = array![[0_u32, 1], [2, 0], [0, 3]];
        assert_eq!(
            serde_json::json!([[0, 1], [2, 0], [0, 3]]),
            to_nested(labels.view())
        );
    }

    #[test]
    fn to_nested_5d_shape() {
        let values = Array5::<f64>::from_elem((2, 1, 1, 2, 3), 0.5);
        let nested = to_nested(values.view());
        assert_eq!(2, nested.as_array().unwrap().len());
        assert_eq!(
            serde_json::json!([0.5, 0.5, 0.5]),
            nested[1][0][0][1]
        );
    }

    #[test]
    fn to_nested_empty_axis() {
        let values = Array2::<f64>::zeros((0, 4));
        assert_eq!(serde_json::json!([]), to_nested(values.view()));
    }
}
