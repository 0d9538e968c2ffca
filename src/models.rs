//! Data types and associated functions and methods

use crate::error::EngineError;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// Supported numerical data types
///
/// The serialised names match NumPy's dtype names, so descriptors written by other tools can be
/// read back without translation.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    /// [i8]
    Int8,
    /// [i16]
    Int16,
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [u8]
    Uint8,
    /// [u16]
    Uint16,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Int8 => std::mem::size_of::<i8>(),
            Self::Int16 => std::mem::size_of::<i16>(),
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Uint8 => std::mem::size_of::<u8>(),
            Self::Uint16 => std::mem::size_of::<u16>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }

    /// Whether values of this type are whole numbers.
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }
}

/// Names of the five image axes, in storage order.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
pub enum AxisName {
    Time,
    Depth,
    Height,
    Width,
    Channel,
}

impl AxisName {
    /// All axes in (T, Z, Y, X, C) order.
    pub const ALL: [AxisName; 5] = [
        AxisName::Time,
        AxisName::Depth,
        AxisName::Height,
        AxisName::Width,
        AxisName::Channel,
    ];

    /// Position of the axis in a 5D shape.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Shape and data type of a raw array buffer.
///
/// Together with the raw bytes (C order, little endian) this is all that is needed to rebuild an
/// image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    /// Shape of the multi-dimensional array
    pub shape: Vec<usize>,
    /// Data type
    pub dtype: DType,
}

impl Descriptor {
    /// Return a new Descriptor object.
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Descriptor { shape, dtype }
    }

    /// Number of elements described by the shape.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Expected size of the raw buffer in bytes, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size_of(), |acc, dim| acc.checked_mul(*dim))
    }

    /// Parse a descriptor from JSON.
    ///
    /// Any problem with the document (missing shape, unknown dtype, malformed JSON) is reported
    /// as [EngineError::CorruptDescriptor].
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|err| EngineError::CorruptDescriptor {
            reason: err.to_string(),
        })
    }

    /// Parse a descriptor from an already decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, EngineError> {
        serde_json::from_value(value).map_err(|err| EngineError::CorruptDescriptor {
            reason: err.to_string(),
        })
    }
}

/// Validate raw data size against a descriptor.
///
/// # Arguments
///
/// * `raw_size`: Size of the raw data in bytes.
/// * `descriptor`: Shape and data type the data claims to have
pub fn validate_raw_size(raw_size: usize, descriptor: &Descriptor) -> Result<(), EngineError> {
    match descriptor.byte_len() {
        Some(expected_size) if expected_size == raw_size => Ok(()),
        Some(expected_size) => Err(EngineError::CorruptDescriptor {
            reason: format!(
                "raw data size {} does not match shape {:?} with {} ({} bytes expected)",
                raw_size, descriptor.shape, descriptor.dtype, expected_size
            ),
        }),
        None => Err(EngineError::CorruptDescriptor {
            reason: format!("shape {:?} is too large", descriptor.shape),
        }),
    }
}

/// Image metadata derived from the array shape.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MetadataRecord {
    #[serde(rename = "Time")]
    pub time_frames: usize,
    #[serde(rename = "Depth")]
    pub depth: usize,
    #[serde(rename = "Height")]
    pub height: usize,
    #[serde(rename = "Width")]
    pub width: usize,
    #[serde(rename = "Channels")]
    pub channels: usize,
}

impl MetadataRecord {
    /// The shape as a (T, Z, Y, X, C) array.
    pub fn shape(&self) -> [usize; 5] {
        [
            self.time_frames,
            self.depth,
            self.height,
            self.width,
            self.channels,
        ]
    }

    /// Number of pixels (rows of channel values).
    pub fn pixels(&self) -> usize {
        self.time_frames * self.depth * self.height * self.width
    }

    /// Whether any axis has zero extent.
    pub fn is_degenerate(&self) -> bool {
        self.shape().contains(&0)
    }
}

/// Summary statistics of one channel.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics keyed by channel index.
pub type StatisticsRecord = BTreeMap<usize, ChannelStatistics>;

/// Everything persisted for one image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributeRecord {
    /// Unique name of the image
    pub filename: String,
    /// Raw array data, C order, little endian
    pub raw_bytes: Bytes,
    /// Metadata derived from the shape
    pub metadata: MetadataRecord,
    /// Shape and dtype of `raw_bytes`
    pub shape_dtype_descriptor: Descriptor,
}

/// Result of [crate::engine::Engine::process].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessOutput {
    Attributes(AttributeRecord),
    Metadata(MetadataRecord),
}
