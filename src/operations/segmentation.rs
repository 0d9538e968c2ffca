//! Plane extraction, Otsu thresholding and connected component labelling.

use crate::error::EngineError;
use crate::image::ImageArray;
use crate::models::DType;
use crate::tiles::Shape5;

use ndarray::{Array2, ArrayView2};
use ndarray_stats::QuantileExt;
use rayon::ThreadPool;
use tracing::instrument;

/// Number of histogram bins used to search for the Otsu threshold.
const OTSU_BINS: usize = 256;

/// Extract the (Y, X) plane at `(time, z, channel)`.
///
/// Only the tiles intersecting the plane are read.
#[instrument(skip(image, pool))]
pub fn extract_slice(
    image: &ImageArray,
    time: usize,
    z: usize,
    channel: usize,
    tile: Shape5,
    pool: Option<&ThreadPool>,
) -> Result<Array2<f64>, EngineError> {
    let mut lazy = image.tiled(tile);
    let plane = lazy.plane(time, z, channel)?;
    lazy.compute_plane(plane, pool)
}

/// Otsu's threshold of a plane.
///
/// For integer dtypes every integer value between the plane's minimum and maximum is its own
/// histogram bin, and the threshold is one of the values present in the plane. Float planes are
/// binned into 256 bins between the minimum and maximum, and the threshold is the centre of a
/// bin. Either way the candidate maximising the between-class variance wins, the lowest one on a
/// tie. The threshold of a constant plane is its value.
pub fn otsu_threshold(plane: ArrayView2<f64>, dtype: DType) -> Result<f64, EngineError> {
    let degenerate = || EngineError::DegenerateArray {
        operation: "Otsu threshold",
        shape: plane.shape().to_vec(),
    };
    let min = *plane.min().map_err(|_| degenerate())?;
    let max = *plane.max().map_err(|_| degenerate())?;
    if min == max {
        return Ok(min);
    }
    let (centres, histogram) = if dtype.is_integer() {
        integer_histogram(plane)
    } else {
        binned_histogram(plane, min, max)
    };
    Ok(centres[best_split(&centres, &histogram)])
}

/// Histogram with one bin per distinct value.
///
/// Empty integer bins never change the class split, so leaving them out selects the same
/// threshold as a dense histogram over `[min, max]`.
fn integer_histogram(plane: ArrayView2<f64>) -> (Vec<f64>, Vec<u64>) {
    let mut values: Vec<f64> = plane.iter().copied().collect();
    values.sort_unstable_by(f64::total_cmp);
    let mut centres: Vec<f64> = Vec::new();
    let mut histogram: Vec<u64> = Vec::new();
    for value in values {
        match (centres.last(), histogram.last_mut()) {
            (Some(last), Some(count)) if *last == value => *count += 1,
            _ => {
                centres.push(value);
                histogram.push(1);
            }
        }
    }
    (centres, histogram)
}

/// Histogram of `OTSU_BINS` equal bins between `min` and `max`, with the bin centres.
fn binned_histogram(plane: ArrayView2<f64>, min: f64, max: f64) -> (Vec<f64>, Vec<u64>) {
    let width = (max - min) / OTSU_BINS as f64;
    let mut histogram = vec![0_u64; OTSU_BINS];
    for value in plane.iter() {
        let bin = (((value - min) / width) as usize).min(OTSU_BINS - 1);
        histogram[bin] += 1;
    }
    let centres = (0..OTSU_BINS)
        .map(|bin| min + (bin as f64 + 0.5) * width)
        .collect();
    (centres, histogram)
}

/// Index of the last bin of the lower class in the split maximising between-class variance.
fn best_split(centres: &[f64], histogram: &[u64]) -> usize {
    // Class weights and means below (inclusive) and above (exclusive) each candidate bin.
    let total: u64 = histogram.iter().sum();
    let total_moment: f64 = histogram
        .iter()
        .zip(centres)
        .map(|(count, centre)| *count as f64 * centre)
        .sum();
    let mut weight_below = 0_u64;
    let mut moment_below = 0.0;
    let mut best = (f64::NEG_INFINITY, 0);
    for bin in 0..histogram.len().saturating_sub(1) {
        weight_below += histogram[bin];
        moment_below += histogram[bin] as f64 * centres[bin];
        let weight_above = total - weight_below;
        if weight_below == 0 || weight_above == 0 {
            continue;
        }
        let mean_below = moment_below / weight_below as f64;
        let mean_above = (total_moment - moment_below) / weight_above as f64;
        let variance =
            weight_below as f64 * weight_above as f64 * (mean_below - mean_above).powi(2);
        if variance > best.0 {
            best = (variance, bin);
        }
    }
    best.1
}

/// Root of `label` with path halving.
fn find_root(parents: &mut [u32], label: u32) -> u32 {
    let mut current = label;
    while current != parents[current as usize] {
        parents[current as usize] = parents[parents[current as usize] as usize];
        current = parents[current as usize];
    }
    current
}

/// Merge the sets of two labels, keeping the smaller root.
fn union(parents: &mut [u32], a: u32, b: u32) {
    let (a, b) = (find_root(parents, a), find_root(parents, b));
    if a < b {
        parents[b as usize] = a;
    } else if b < a {
        parents[a as usize] = b;
    }
}

/// Label the 8-connected components of a foreground mask.
///
/// Background is 0. Components are numbered from 1 in row-major order of their first pixel.
pub fn label_components(mask: ArrayView2<bool>) -> Array2<u32> {
    let (height, width) = mask.dim();
    let mut labels = Array2::<u32>::zeros((height, width));
    let mut parents: Vec<u32> = vec![0];

    // First pass: provisional labels and equivalences.
    for y in 0..height {
        for x in 0..width {
            if !mask[[y, x]] {
                continue;
            }
            let mut neighbours = [0_u32; 4];
            if y > 0 {
                if x > 0 {
                    neighbours[0] = labels[[y - 1, x - 1]];
                }
                neighbours[1] = labels[[y - 1, x]];
                if x + 1 < width {
                    neighbours[2] = labels[[y - 1, x + 1]];
                }
            }
            if x > 0 {
                neighbours[3] = labels[[y, x - 1]];
            }
            match neighbours.iter().copied().filter(|l| *l > 0).min() {
                None => {
                    let label = parents.len() as u32;
                    parents.push(label);
                    labels[[y, x]] = label;
                }
                Some(smallest) => {
                    labels[[y, x]] = smallest;
                    for neighbour in neighbours.iter().copied().filter(|l| *l > smallest) {
                        union(&mut parents, smallest, neighbour);
                    }
                }
            }
        }
    }

    // Resolve roots to sequential ids. Roots are the smallest label in their set, so ids follow
    // the scan order of each component's first pixel.
    let mut relabel = vec![0_u32; parents.len()];
    let mut next = 1;
    for label in 1..parents.len() as u32 {
        let root = find_root(&mut parents, label);
        if relabel[root as usize] == 0 {
            relabel[root as usize] = next;
            next += 1;
        }
        relabel[label as usize] = relabel[root as usize];
    }

    // Second pass.
    labels.mapv_inplace(|label| relabel[label as usize]);
    labels
}

/// Segment the plane at `(time, z, channel)`.
///
/// Pixels brighter than the plane's Otsu threshold, computed for the image's dtype, are
/// foreground, and connected foreground pixels (including diagonal neighbours) share a label.
#[instrument(skip(image, pool))]
pub fn segment(
    image: &ImageArray,
    time: usize,
    z: usize,
    channel: usize,
    tile: Shape5,
    pool: Option<&ThreadPool>,
) -> Result<Array2<u32>, EngineError> {
    let plane = extract_slice(image, time, z, channel, tile, pool)?;
    let threshold = otsu_threshold(plane.view(), image.dtype())?;
    let mask = plane.mapv(|value| value > threshold);
    Ok(label_components(mask.view()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::AxisName;
    use crate::source::MemorySource;
    use crate::test_utils;
    use ndarray::array;

    const TILE: Shape5 = [1, 1, 256, 256, 1];

    fn mask(pattern: &[&[u8]]) -> Array2<bool> {
        Array2::from_shape_fn((pattern.len(), pattern[0].len()), |(y, x)| pattern[y][x] > 0)
    }

    #[test]
    fn extract_ramp_plane() {
        let image = test_utils::ramp_image();
        let plane = extract_slice(&image, 1, 0, 1, [1, 1, 3, 3, 1], None).unwrap();
        assert_eq!((4, 4), plane.dim());
        assert_eq!(33.0, plane[[0, 0]]);
        assert_eq!(35.0, plane[[0, 1]]);
        assert_eq!(63.0, plane[[3, 3]]);
    }

    #[test]
    fn extract_out_of_range() {
        let image = test_utils::ramp_image();
        for (time, z, channel, axis, index, extent) in [
            (2, 0, 0, AxisName::Time, 2, 2),
            (0, 4, 0, AxisName::Depth, 4, 1),
            (1, 0, 9, AxisName::Channel, 9, 2),
        ] {
            match extract_slice(&image, time, z, channel, TILE, None).unwrap_err() {
                EngineError::IndexOutOfRange {
                    axis: actual_axis,
                    index: actual_index,
                    extent: actual_extent,
                } => {
                    assert_eq!(axis, actual_axis);
                    assert_eq!(index, actual_index);
                    assert_eq!(extent, actual_extent);
                }
                err => panic!("unexpected error {}", err),
            }
        }
    }

    /// Otsu over a dense histogram with one bin per integer in `[min, max]`.
    fn dense_integer_otsu(values: &[u16]) -> f64 {
        let min = *values.iter().min().unwrap() as usize;
        let max = *values.iter().max().unwrap() as usize;
        let mut histogram = vec![0_u64; max - min + 1];
        values.iter().for_each(|v| histogram[*v as usize - min] += 1);
        let total = values.len() as f64;
        let total_moment: f64 = values.iter().map(|v| *v as f64).sum();
        let (mut weight, mut moment) = (0.0, 0.0);
        let mut best = (f64::NEG_INFINITY, min);
        for (bin, count) in histogram.iter().enumerate().take(histogram.len() - 1) {
            weight += *count as f64;
            moment += *count as f64 * (min + bin) as f64;
            if weight == 0.0 || weight == total {
                continue;
            }
            let between = weight
                * (total - weight)
                * (moment / weight - (total_moment - moment) / (total - weight)).powi(2);
            if between > best.0 {
                best = (between, min + bin);
            }
        }
        best.1 as f64
    }

    #[test]
    fn otsu_bimodal() {
        let plane = array![[1.0, 1.0, 2.0, 9.0], [1.0, 2.0, 10.0, 10.0]];
        let threshold = otsu_threshold(plane.view(), DType::Float64).unwrap();
        assert!(threshold > 2.0 && threshold < 9.0, "{}", threshold);
    }

    #[test]
    fn otsu_two_values() {
        let plane = array![[0.0, 255.0], [0.0, 255.0]];
        let threshold = otsu_threshold(plane.view(), DType::Float32).unwrap();
        // Centre of the first bin.
        assert_eq!(0.498046875, threshold);
        // An integer plane splits on a value present in the plane.
        assert_eq!(0.0, otsu_threshold(plane.view(), DType::Uint8).unwrap());
    }

    #[test]
    fn otsu_uint16_matches_dense_histogram() {
        // Deterministic pseudo-random planes spread over 0..60000.
        let mut state = 0x2545_f491_u64;
        for _ in 0..50 {
            let values: Vec<u16> = (0..400)
                .map(|_| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    ((state >> 33) % 60_000) as u16
                })
                .collect();
            let plane = Array2::from_shape_fn((20, 20), |(y, x)| values[y * 20 + x] as f64);
            let threshold = otsu_threshold(plane.view(), DType::Uint16).unwrap();
            assert_eq!(dense_integer_otsu(&values), threshold);
            assert_eq!(threshold.fract(), 0.0);
        }
    }

    #[test]
    fn segment_uses_integer_threshold() {
        let values: Vec<u16> = vec![100, 100, 101, 30961, 30962, 60000];
        let image = ImageArray::from_memory(
            MemorySource::from_vec(values.clone(), vec![1, 1, 2, 3, 1]).unwrap(),
        )
        .unwrap();
        let threshold = dense_integer_otsu(&values);
        let labels = segment(&image, 0, 0, 0, TILE, None).unwrap();
        for (label, value) in labels.iter().zip(&values) {
            assert_eq!(*value as f64 > threshold, *label > 0);
        }
    }

    #[test]
    fn otsu_constant_plane() {
        let plane = Array2::from_elem((3, 3), 7.5);
        assert_eq!(7.5, otsu_threshold(plane.view(), DType::Float64).unwrap());
    }

    #[test]
    fn otsu_empty_plane() {
        let err = otsu_threshold(Array2::<f64>::zeros((0, 4)).view(), DType::Uint8).unwrap_err();
        assert_eq!(
            "cannot compute Otsu threshold on degenerate array with shape [0, 4]",
            err.to_string()
        );
    }

    #[test]
    fn label_empty_mask() {
        let labels = label_components(mask(&[&[0, 0, 0], &[0, 0, 0]]).view());
        assert!(labels.iter().all(|l| *l == 0));
    }

    #[test]
    fn label_diagonal_is_connected() {
        let labels = label_components(
            mask(&[
                &[1, 0, 0, 0], //
                &[0, 1, 0, 1],
                &[0, 0, 1, 0],
            ])
            .view(),
        );
        assert!(labels.iter().filter(|l| **l > 0).all(|l| *l == 1));
    }

    #[test]
    fn label_sequential_row_major() {
        let labels = label_components(
            mask(&[
                &[0, 0, 0, 1, 1],
                &[1, 0, 0, 0, 0],
                &[1, 0, 1, 1, 0],
                &[0, 0, 0, 0, 0],
                &[1, 1, 0, 0, 1],
            ])
            .view(),
        );
        assert_eq!(
            array![
                [0_u32, 0, 0, 1, 1],
                [2, 0, 0, 0, 0],
                [2, 0, 3, 3, 0],
                [0, 0, 0, 0, 0],
                [4, 4, 0, 0, 5],
            ],
            labels
        );
    }

    #[test]
    fn label_u_shape_merges() {
        let labels = label_components(
            mask(&[
                &[1, 0, 1, 0, 1],
                &[1, 0, 1, 0, 1],
                &[1, 1, 1, 1, 1],
            ])
            .view(),
        );
        assert_eq!(1, *labels.iter().max().unwrap());
        assert_eq!(0, labels[[0, 1]]);
    }

    #[test]
    fn segment_blobs() {
        #[rustfmt::skip]
        let values: Vec<u8> = vec![
            10, 10, 10, 10, 10, 10,
            10, 200, 200, 10, 10, 10,
            10, 200, 10, 10, 10, 200,
            10, 10, 10, 10, 200, 200,
            10, 10, 10, 10, 10, 10,
        ];
        let image = ImageArray::from_memory(
            MemorySource::from_vec(values, vec![1, 1, 5, 6, 1]).unwrap(),
        )
        .unwrap();
        let labels = segment(&image, 0, 0, 0, [1, 1, 2, 4, 1], None).unwrap();
        assert_eq!((5, 6), labels.dim());
        assert_eq!(1, labels[[1, 1]]);
        assert_eq!(1, labels[[2, 1]]);
        assert_eq!(2, labels[[2, 5]]);
        assert_eq!(2, labels[[3, 4]]);
        assert_eq!(0, labels[[0, 0]]);
        assert_eq!(2, *labels.iter().max().unwrap());
    }

    #[test]
    fn segment_is_deterministic() {
        let image = test_utils::ramp_image();
        let first = segment(&image, 1, 0, 0, TILE, None).unwrap();
        let second = segment(&image, 1, 0, 0, [1, 1, 1, 3, 1], None).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().any(|l| *l > 0));
    }
}
