//! Per-channel statistics.

use crate::error::EngineError;
use crate::image::ImageArray;
use crate::models::{ChannelStatistics, StatisticsRecord};
use crate::tiles::Shape5;

use rayon::ThreadPool;
use tracing::instrument;

/// Compute the mean, population standard deviation, min and max of every channel.
///
/// Each tile is reduced to partial accumulators which are then combined, so only one tile per
/// worker is held in memory at a time.
///
/// # Arguments
///
/// * `image`: Image to reduce
/// * `tile`: Tile extent
/// * `pool`: Optional thread pool used to reduce tiles in parallel
#[instrument(skip(image, pool), fields(shape = ?image.shape()))]
pub fn compute_statistics(
    image: &ImageArray,
    tile: Shape5,
    pool: Option<&ThreadPool>,
) -> Result<StatisticsRecord, EngineError> {
    let metadata = image.metadata();
    if metadata.is_degenerate() {
        return Err(EngineError::DegenerateArray {
            operation: "statistics",
            shape: metadata.shape().to_vec(),
        });
    }
    let mut lazy = image.tiled(tile);
    let root = lazy.reduce()?;
    let partials = lazy.compute_partials(root, pool)?;
    Ok(partials
        .0
        .iter()
        .enumerate()
        .map(|(channel, accumulator)| {
            (
                channel,
                ChannelStatistics {
                    mean: accumulator.mean(),
                    std: accumulator.std(),
                    min: accumulator.min,
                    max: accumulator.max,
                },
            )
        })
        .collect())
}
