//! Shape validation.

use crate::error::EngineError;
use crate::models::MetadataRecord;

/// Check that `shape` has the (T, Z, Y, X, C) layout and derive its metadata.
///
/// Axes of zero extent are accepted here. Operations that reduce over such an axis report
/// [EngineError::DegenerateArray] instead.
pub fn validate(shape: &[usize]) -> Result<MetadataRecord, EngineError> {
    match *shape {
        [time_frames, depth, height, width, channels] => Ok(MetadataRecord {
            time_frames,
            depth,
            height,
            width,
            channels,
        }),
        _ => Err(EngineError::Shape {
            axes: shape.len(),
            shape: shape.to_vec(),
        }),
    }
}
