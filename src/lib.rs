//! This crate provides a chunked analysis engine for large five dimensional microscopy images
//! (time, depth, height, width, channel). Images are never loaded whole: they are split into
//! tiles and every operation is expressed as a lazily evaluated graph over those tiles, so only
//! the tiles an operation needs are read, one at a time.
//!
//! The engine computes
//!
//! * image metadata and single (Y, X) planes,
//! * per-channel statistics reduced over tiles,
//! * an incremental principal component projection fitted one batch of pixels at a time,
//! * Otsu threshold segmentation with connected component labelling,
//!
//! and round-trips images through a byte-exact persisted form (little endian raw bytes plus a
//! shape/dtype descriptor) so they can be rebuilt without the original file.
//!
//! The engine is built on top of a number of open source components.
//!
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used in numerical
//!   computation, and [nalgebra] the singular value decomposition.
//! * [Rayon](rayon) evaluates independent tiles in parallel.
//! * [tiff] decodes multi-page TIFF files.
//! * [sled] is the embedded store used to persist assembled records.
//! * [Serde](serde) performs (de)serialisation of descriptors, records and results.

pub mod app;
pub mod array;
pub mod assembler;
pub mod cli;
pub mod codec;
pub mod engine;
pub mod error;
pub mod graph;
pub mod image;
pub mod models;
pub mod operation;
pub mod operations;
pub mod source;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tiles;
pub mod tracing;
pub mod types;
pub mod validate;
