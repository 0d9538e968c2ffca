//! Binary codec: image ⇄ raw bytes plus a shape/dtype descriptor.
//!
//! Persisted bytes are C order and little endian on every platform.

use crate::array;
use crate::error::EngineError;
use crate::image::ImageArray;
use crate::models::{validate_raw_size, Descriptor};
use crate::source::MemorySource;
use crate::types::PERSISTED_BYTE_ORDER;

use bytes::Bytes;
use tracing::instrument;

/// Encode an image as raw bytes and the descriptor needed to rebuild it.
///
/// The whole image is read from its source.
#[instrument(skip(image), fields(shape = ?image.shape(), dtype = %image.dtype()))]
pub fn encode(image: &ImageArray) -> Result<(Bytes, Descriptor), EngineError> {
    let data = image.source().read_bytes()?;
    let data = if PERSISTED_BYTE_ORDER.needs_swap() {
        let mut swapped = data.to_vec();
        array::reverse_byte_order(&mut swapped, image.dtype().size_of());
        Bytes::from(swapped)
    } else {
        data
    };
    Ok((data, Descriptor::new(image.shape().to_vec(), image.dtype())))
}

/// Rebuild an image from persisted bytes.
///
/// # Arguments
///
/// * `data`: Raw bytes as produced by [encode]
/// * `descriptor`: Shape and dtype of `data`
pub fn decode(data: &[u8], descriptor: &Descriptor) -> Result<ImageArray, EngineError> {
    validate_raw_size(data.len(), descriptor)?;
    let data = if PERSISTED_BYTE_ORDER.needs_swap() {
        let mut swapped = data.to_vec();
        array::reverse_byte_order(&mut swapped, descriptor.dtype.size_of());
        array::aligned_copy(&swapped)
    } else {
        array::aligned_copy(data)
    };
    ImageArray::from_memory(MemorySource::new(
        data,
        descriptor.shape.clone(),
        descriptor.dtype,
    )?)
}

/// Rebuild an image from persisted bytes and a JSON descriptor.
pub fn decode_json(data: &[u8], descriptor: &str) -> Result<ImageArray, EngineError> {
    decode(data, &Descriptor::from_json(descriptor)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::DType;
    use crate::test_utils;
    use crate::tiles::Region;

    #[test]
    fn encode_ramp_is_little_endian() {
        let image = test_utils::ramp_image();
        let (data, descriptor) = encode(&image).unwrap();
        assert_eq!(Descriptor::new(vec![2, 1, 4, 4, 2], DType::Uint16), descriptor);
        assert_eq!(128, data.len());
        assert_eq!(&[0, 0, 1, 0, 2, 0], &data[..6]);
        assert_eq!(&[63, 0], &data[126..]);
    }

    #[test]
    fn round_trip_ramp() {
        let image = test_utils::ramp_image();
        let (data, descriptor) = encode(&image).unwrap();
        let decoded = decode(&data, &descriptor).unwrap();
        assert_eq!(image.metadata(), decoded.metadata());
        assert_eq!(image.dtype(), decoded.dtype());
        let full = Region::full(image.shape());
        assert_eq!(
            image.source().read_region(&full).unwrap(),
            decoded.source().read_region(&full).unwrap()
        );
        assert_eq!(data, encode(&decoded).unwrap().0);
    }

    #[test]
    fn round_trip_float_bits() {
        let values = vec![f32::MIN_POSITIVE, -0.0, 1.0e-40, f32::MAX, -1.5, 3.25];
        let image = ImageArray::from_memory(
            MemorySource::from_vec(values.clone(), vec![1, 1, 1, 3, 2]).unwrap(),
        )
        .unwrap();
        let (data, descriptor) = encode(&image).unwrap();
        let decoded = decode(&data, &descriptor).unwrap();
        let bytes = decoded.source().read_bytes().unwrap();
        let decoded_values = array::from_bytes::<f32>(&bytes).unwrap();
        for (a, b) in values.iter().zip(decoded_values) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn decode_unaligned_input() {
        let (data, descriptor) = encode(&test_utils::ramp_image()).unwrap();
        let mut shifted = vec![0_u8];
        shifted.extend_from_slice(&data);
        let decoded = decode(&shifted[1..], &descriptor).unwrap();
        assert_eq!(data, decoded.source().read_bytes().unwrap());
    }

    #[test]
    #[should_panic(expected = "raw data size 127 does not match shape [2, 1, 4, 4, 2] with uint16")]
    fn decode_truncated() {
        let (data, descriptor) = encode(&test_utils::ramp_image()).unwrap();
        decode(&data[..127], &descriptor).unwrap();
    }

    #[test]
    fn decode_not_5d() {
        let descriptor = Descriptor::new(vec![4, 4], DType::Uint8);
        let err = decode(&[0; 16], &descriptor).unwrap_err();
        assert_eq!("ShapeError", err.kind());
    }

    #[test]
    fn decode_json_missing_shape() {
        let err = decode_json(&[0; 4], r#"{"dtype": "uint8"}"#).unwrap_err();
        assert_eq!("CorruptDescriptorError", err.kind());
    }

    #[test]
    fn decode_json_unknown_dtype() {
        let err = decode_json(&[0; 4], r#"{"shape": [1, 1, 2, 2, 1], "dtype": "float16"}"#)
            .unwrap_err();
        assert_eq!("CorruptDescriptorError", err.kind());
    }
}
