//! Numerical operations over tiled images.
//!
//! * [statistics]: per-channel summary statistics reduced over tiles
//! * [pca]: incremental principal component analysis fitted tile by tile
//! * [segmentation]: plane extraction, Otsu thresholding and connected component labelling

pub mod pca;
pub mod segmentation;
pub mod statistics;

pub use pca::{fit_transform, IncrementalPca};
pub use segmentation::{extract_slice, label_components, otsu_threshold, segment};
pub use statistics::compute_statistics;
