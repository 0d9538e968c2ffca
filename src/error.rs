//! Error handling.

use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};

use crate::models::AxisName;

/// Image analysis engine error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant maps to a stable kind via [EngineError::kind].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Image does not have exactly five axes
    #[error("image must have 5 dimensions (T, Z, Y, X, C), got {axes} with shape {shape:?}")]
    Shape { axes: usize, shape: Vec<usize> },

    /// Coordinate outside the extent of an axis
    #[error("{axis} index {index} is out of range for extent {extent}")]
    IndexOutOfRange {
        axis: AxisName,
        index: usize,
        extent: usize,
    },

    /// Requested more components than there are channels
    #[error("n_components ({requested}) must be between 1 and the number of channels ({channels})")]
    InvalidComponentCount { requested: usize, channels: usize },

    /// Projection with a model that has seen no samples
    #[error("PCA model must be fitted before transforming")]
    NotFitted,

    /// Attempt to reduce over an empty domain
    #[error("cannot compute {operation} on degenerate array with shape {shape:?}")]
    DegenerateArray {
        operation: &'static str,
        shape: Vec<usize>,
    },

    /// Shape/dtype descriptor does not describe the raw bytes
    #[error("corrupt shape/dtype descriptor: {reason}")]
    CorruptDescriptor { reason: String },

    /// Neither a readable file nor persisted bytes were found
    #[error("image source {name} is unavailable")]
    SourceUnavailable { name: String },

    /// A record with the same filename has already been stored
    #[error("a record for {filename} already exists")]
    DuplicateRecord { filename: String },

    /// An operation needs a record store but none is configured
    #[error("no record store is configured")]
    NoStore,

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// A tile graph node received an input of the wrong kind
    #[error("invalid tile graph at node {node}: {reason}")]
    InvalidGraph { node: usize, reason: &'static str },

    /// TIFF file whose page layout cannot be mapped onto five axes
    #[error("unsupported TIFF layout: {reason}")]
    UnsupportedTiff { reason: String },

    /// Singular value decomposition failed to converge
    #[error("singular value decomposition did not converge")]
    Linalg,

    /// Error validating the engine configuration
    #[error("engine configuration is not valid")]
    InvalidConfig(#[from] validator::ValidationErrors),

    /// Error reading an image file
    #[error("failed to read image file")]
    Io(#[from] std::io::Error),

    /// Error decoding a TIFF file
    #[error("failed to decode TIFF image")]
    Tiff(#[from] tiff::TiffError),

    /// Error from the embedded record store
    #[error("record store error")]
    Store(#[from] sled::Error),

    /// Error (de)serialising a record
    #[error("failed to (de)serialise record")]
    Json(#[from] serde_json::Error),

    /// Error creating ndarray ArrayView from Shape
    #[error("failed to create array from shape")]
    NdShape(#[from] ndarray::ShapeError),

    /// Error building the tile evaluation thread pool
    #[error("failed to build thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl EngineError {
    /// Stable name of the error kind, reported to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Shape { .. } => "ShapeError",
            EngineError::IndexOutOfRange { .. } => "IndexOutOfRangeError",
            EngineError::InvalidComponentCount { .. } => "InvalidComponentCountError",
            EngineError::NotFitted => "NotFittedError",
            EngineError::DegenerateArray { .. } => "DegenerateArrayError",
            EngineError::CorruptDescriptor { .. } => "CorruptDescriptorError",
            EngineError::SourceUnavailable { .. } => "SourceUnavailableError",
            EngineError::DuplicateRecord { .. } => "DuplicateRecordError",
            EngineError::InvalidConfig(_) | EngineError::NoStore => "InvalidConfigError",
            EngineError::UnsupportedTiff { .. } | EngineError::Tiff(_) => "UnsupportedFileError",
            EngineError::FromBytes { .. }
            | EngineError::InvalidGraph { .. }
            | EngineError::Linalg
            | EngineError::Io(_)
            | EngineError::Store(_)
            | EngineError::Json(_)
            | EngineError::NdShape(_)
            | EngineError::ThreadPool(_) => "InternalError",
        }
    }

    /// Whether the error is caused by the caller's input rather than the engine or environment.
    pub fn is_input_error(&self) -> bool {
        self.kind() != "InternalError"
    }
}

/// Tagged failure result
///
/// Implements serde (de)serialise. This is what callers of the engine receive instead of a
/// partially populated record.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Failure {
    /// Error kind, e.g. `IndexOutOfRangeError`
    pub kind: String,

    /// Main error message, including the offending value
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl Failure {
    /// Return a new Failure
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new(error: &EngineError) -> Self {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        Failure {
            kind: error.kind().to_string(),
            message,
            caused_by,
        }
    }
}

impl From<EngineError> for Failure {
    /// Convert from an `EngineError` into a `Failure`.
    fn from(error: EngineError) -> Self {
        // Log internal errors.
        if !error.is_input_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }
        Failure::new(&error)
    }
}
