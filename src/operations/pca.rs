//! Incremental principal component analysis.
//!
//! The model is fitted one batch of pixel rows at a time using the incremental SVD update of
//! Ross et al. (2008): the previous basis, scaled by its singular values, is stacked on top of
//! the mean-centred batch and a mean correction row, and the thin SVD of that stack gives the
//! new basis. Only one batch is held in memory.

use crate::error::EngineError;
use crate::image::ImageArray;
use crate::tiles::{Region, TileGrid};

use nalgebra::DMatrix;
use ndarray::{concatenate, Array1, Array2, Array5, ArrayView2, Axis, ErrorKind, ShapeError};
use tracing::{event, instrument, Level};

/// A principal component model fitted incrementally.
#[derive(Clone, Debug, PartialEq)]
pub struct IncrementalPca {
    n_components: usize,
    /// Principal axes, one row per component, sorted by decreasing singular value
    components: Array2<f64>,
    singular_values: Array1<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
    /// Per-feature mean of all rows seen
    mean: Array1<f64>,
    /// Per-feature population variance of all rows seen
    var: Array1<f64>,
    n_samples_seen: u64,
}

impl IncrementalPca {
    /// Returns an unfitted model.
    ///
    /// # Arguments
    ///
    /// * `n_components`: Number of components to keep, between 1 and `n_features`
    /// * `n_features`: Number of features (channels) per row
    pub fn new(n_components: usize, n_features: usize) -> Result<Self, EngineError> {
        if n_components == 0 || n_components > n_features {
            return Err(EngineError::InvalidComponentCount {
                requested: n_components,
                channels: n_features,
            });
        }
        Ok(IncrementalPca {
            n_components,
            components: Array2::zeros((0, n_features)),
            singular_values: Array1::zeros(0),
            explained_variance: Array1::zeros(0),
            explained_variance_ratio: Array1::zeros(0),
            mean: Array1::zeros(n_features),
            var: Array1::zeros(n_features),
            n_samples_seen: 0,
        })
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    pub fn explained_variance_ratio(&self) -> &Array1<f64> {
        &self.explained_variance_ratio
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn var(&self) -> &Array1<f64> {
        &self.var
    }

    pub fn n_samples_seen(&self) -> u64 {
        self.n_samples_seen
    }

    pub fn is_fitted(&self) -> bool {
        self.n_samples_seen > 0
    }

    /// Update the model with one batch of rows.
    ///
    /// The first batch must contain at least `n_components` rows.
    pub fn partial_fit(&mut self, batch: ArrayView2<f64>) -> Result<(), EngineError> {
        let (rows, features) = batch.dim();
        if features != self.n_features() {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        if rows == 0 {
            return Ok(());
        }
        if !self.is_fitted() && rows < self.n_components {
            return Err(EngineError::DegenerateArray {
                operation: "incremental PCA",
                shape: vec![rows, features],
            });
        }

        // Running mean and variance (Chan, Golub and LeVeque).
        let last_n = self.n_samples_seen as f64;
        let new_n = rows as f64;
        let total_n = last_n + new_n;
        let batch_mean = batch
            .mean_axis(Axis(0))
            .ok_or(ShapeError::from_kind(ErrorKind::OutOfBounds))?;
        let centred = &batch - &batch_mean;
        let batch_unnormalised = centred.mapv(|v| v * v).sum_axis(Axis(0));
        let delta = &batch_mean - &self.mean;
        let updated_mean = &self.mean + &(&delta * (new_n / total_n));
        let updated_unnormalised = &self.var * last_n
            + &batch_unnormalised
            + &(delta.mapv(|d| d * d) * (last_n * new_n / total_n));
        let updated_var = updated_unnormalised / total_n;

        let stacked = if self.is_fitted() {
            let scaled = &self.components * &self.singular_values.view().insert_axis(Axis(1));
            let correction = (&self.mean - &batch_mean) * (last_n / total_n * new_n).sqrt();
            concatenate(
                Axis(0),
                &[
                    scaled.view(),
                    centred.view(),
                    correction.view().insert_axis(Axis(0)),
                ],
            )?
        } else {
            centred
        };

        let (singular_values, components) = thin_svd(stacked.view(), self.n_components)?;
        let explained_variance = singular_values.mapv(|s| s * s / (total_n - 1.0).max(1.0));
        let total_variance = updated_var.sum() * total_n;
        let explained_variance_ratio = if total_variance > 0.0 {
            singular_values.mapv(|s| s * s / total_variance)
        } else {
            Array1::zeros(singular_values.len())
        };

        self.components = components;
        self.singular_values = singular_values;
        self.explained_variance = explained_variance;
        self.explained_variance_ratio = explained_variance_ratio;
        self.mean = updated_mean;
        self.var = updated_var;
        self.n_samples_seen += rows as u64;
        Ok(())
    }

    /// Project rows onto the principal axes: `(rows - mean) · componentsᵀ`.
    ///
    /// Fails with [EngineError::NotFitted] before the first [IncrementalPca::partial_fit].
    pub fn transform(&self, rows: ArrayView2<f64>) -> Result<Array2<f64>, EngineError> {
        if !self.is_fitted() {
            return Err(EngineError::NotFitted);
        }
        if rows.ncols() != self.n_features() {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        Ok((&rows - &self.mean).dot(&self.components.t()))
    }
}

/// Thin SVD of `matrix`, returning the top `k` singular values and right singular vectors.
///
/// Each right singular vector is flipped so that its largest-magnitude entry is positive.
fn thin_svd(matrix: ArrayView2<f64>, k: usize) -> Result<(Array1<f64>, Array2<f64>), EngineError> {
    let (rows, cols) = matrix.dim();
    let svd = DMatrix::from_fn(rows, cols, |r, c| matrix[[r, c]])
        .try_svd(false, true, f64::EPSILON, 0)
        .ok_or(EngineError::Linalg)?;
    let v_t = svd.v_t.ok_or(EngineError::Linalg)?;

    // Sort by descending singular value.
    let mut indices: Vec<usize> = (0..svd.singular_values.len()).collect();
    indices.sort_by(|&a, &b| {
        svd.singular_values[b]
            .partial_cmp(&svd.singular_values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if indices.len() < k {
        return Err(EngineError::DegenerateArray {
            operation: "incremental PCA",
            shape: vec![rows, cols],
        });
    }

    let mut singular_values = Array1::zeros(k);
    let mut components = Array2::zeros((k, cols));
    for (row, &index) in indices.iter().take(k).enumerate() {
        singular_values[row] = svd.singular_values[index];
        let mut component = components.row_mut(row);
        for col in 0..cols {
            component[col] = v_t[(index, col)];
        }
        let pivot = component
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            component.mapv_inplace(|v| -v);
        }
    }
    Ok((singular_values, components))
}

/// Flatten a (1, 1, Y, X, C) tile into (Y·X, C) rows.
fn tile_rows(data: Array5<f64>) -> Result<Array2<f64>, EngineError> {
    let channels = data.len_of(Axis(4));
    let rows = data.len() / channels.max(1);
    Ok(data
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, channels))?)
}

/// Fit an [IncrementalPca] over every pixel of `image`.
///
/// Pixels are read in channel-spanning tiles of `tile_height` × `tile_width` and buffered into
/// batches of at least `batch_size` rows (and never fewer than `n_components`).
#[instrument(skip(image), fields(shape = ?image.shape()))]
pub fn fit(
    image: &ImageArray,
    n_components: usize,
    tile_height: usize,
    tile_width: usize,
    batch_size: usize,
) -> Result<IncrementalPca, EngineError> {
    let metadata = image.metadata();
    let mut model = IncrementalPca::new(n_components, metadata.channels)?;
    if metadata.pixels() < n_components {
        return Err(EngineError::DegenerateArray {
            operation: "incremental PCA",
            shape: metadata.shape().to_vec(),
        });
    }

    let batch_rows = batch_size.max(n_components);
    let mut lazy = image.tiled([1, 1, tile_height, tile_width, metadata.channels]);
    let tiles: Vec<Region> = lazy.grid().tiles().collect();
    let mut pending: Vec<Array2<f64>> = vec![];
    let mut pending_rows = 0;
    for tile in tiles {
        let node = lazy.tile(tile)?;
        let rows = tile_rows(lazy.compute_dense(node, None)?)?;
        pending_rows += rows.nrows();
        pending.push(rows);
        if pending_rows >= batch_rows {
            flush(&mut model, &mut pending)?;
            pending_rows = 0;
        }
    }
    if pending_rows > 0 {
        flush(&mut model, &mut pending)?;
    }
    event!(
        Level::DEBUG,
        n_samples_seen = model.n_samples_seen(),
        "Fitted {} components",
        n_components
    );
    Ok(model)
}

fn flush(model: &mut IncrementalPca, pending: &mut Vec<Array2<f64>>) -> Result<(), EngineError> {
    let views: Vec<ArrayView2<f64>> = pending.iter().map(|rows| rows.view()).collect();
    let batch = concatenate(Axis(0), &views)?;
    pending.clear();
    model.partial_fit(batch.view())
}

/// Project every pixel of `image` onto the components of a fitted model.
///
/// Returns an array of shape (T, Z, Y, X, k).
pub fn transform(
    image: &ImageArray,
    model: &IncrementalPca,
    tile_height: usize,
    tile_width: usize,
) -> Result<Array5<f64>, EngineError> {
    if !model.is_fitted() {
        return Err(EngineError::NotFitted);
    }
    let [time_frames, depth, height, width, channels] = image.shape();
    let k = model.n_components();
    let mut projection = Array5::<f64>::zeros((time_frames, depth, height, width, k));
    let mut lazy = image.tiled([1, 1, tile_height, tile_width, channels]);
    let grid: TileGrid = *lazy.grid();
    for tile in grid.tiles() {
        let node = lazy.tile(tile)?;
        let projected = model.transform(tile_rows(lazy.compute_dense(node, None)?)?.view())?;
        let mut target = tile;
        target.extent[4] = k;
        target
            .slice_mut(projection.view_mut())
            .assign(&projected.into_shape((1, 1, tile.extent[2], tile.extent[3], k))?);
    }
    Ok(projection)
}

/// Fit a model over `image` and project it onto the first `n_components` principal axes.
///
/// Fails with [EngineError::InvalidComponentCount] unless `1 <= n_components <= channels`.
pub fn fit_transform(
    image: &ImageArray,
    n_components: usize,
    tile_height: usize,
    tile_width: usize,
    batch_size: usize,
) -> Result<(IncrementalPca, Array5<f64>), EngineError> {
    let model = fit(image, n_components, tile_height, tile_width, batch_size)?;
    let projection = transform(image, &model, tile_height, tile_width)?;
    Ok((model, projection))
}
