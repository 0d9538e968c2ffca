//! Engine configuration and the entry points of the analysis engine.

use crate::assembler::{self, ImageSource};
use crate::cli::CommandLineArgs;
use crate::codec;
use crate::error::EngineError;
use crate::image::ImageArray;
use crate::models::{AttributeRecord, Descriptor, MetadataRecord, ProcessOutput, StatisticsRecord};
use crate::operations::{self, IncrementalPca};
use crate::store::RecordStore;
use crate::tiles::Shape5;

use bytes::Bytes;
use ndarray::{Array2, Array5};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{event, Level};
use validator::Validate;

/// What [Engine::process] produces for a source.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// The full [AttributeRecord]
    #[default]
    Attributes,
    /// Only the [MetadataRecord]
    Metadata,
}

/// Engine configuration, passed explicitly to every entry point.
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct EngineConfig {
    /// Tile extent along the Height axis
    #[validate(range(min = 1, message = "tile_height must be greater than 0"))]
    pub tile_height: usize,
    /// Tile extent along the Width axis
    #[validate(range(min = 1, message = "tile_width must be greater than 0"))]
    pub tile_width: usize,
    /// Minimum number of pixel rows per incremental PCA batch
    #[validate(range(min = 1, message = "pca_batch_size must be greater than 0"))]
    pub pca_batch_size: usize,
    /// Number of principal components to keep
    pub n_components: usize,
    /// Size of the tile evaluation thread pool. Defaults to the number of CPUs.
    #[validate(range(min = 1, message = "thread_limit must be greater than 0"))]
    pub thread_limit: Option<usize>,
    /// Whether to evaluate tiles in parallel
    pub use_rayon: bool,
    /// Whether to rebuild images from the record store when their file is missing
    pub reconstruct: bool,
    pub mode: ProcessMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tile_height: 256,
            tile_width: 256,
            pca_batch_size: 100_000,
            n_components: 3,
            thread_limit: None,
            use_rayon: false,
            reconstruct: false,
            mode: ProcessMode::Attributes,
        }
    }
}

impl From<&CommandLineArgs> for EngineConfig {
    fn from(args: &CommandLineArgs) -> Self {
        EngineConfig {
            tile_height: args.tile_height,
            tile_width: args.tile_width,
            pca_batch_size: args.pca_batch_size,
            n_components: args.n_components,
            thread_limit: args.thread_limit,
            use_rayon: args.use_rayon,
            reconstruct: args.reconstruct,
            mode: args.mode,
        }
    }
}

/// The image analysis engine.
///
/// Owns the configuration, the optional thread pool used for tile reductions and the optional
/// record store. Holds no other state, so one engine can serve any number of images.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    pool: Option<ThreadPool>,
}

impl Engine {
    /// Create an engine, validating `config`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let pool = if config.use_rayon {
            let threads = config.thread_limit.unwrap_or_else(num_cpus::get);
            event!(Level::DEBUG, "Using {} threads for tile evaluation", threads);
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("tilestack-{}", index))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Engine {
            config,
            store: None,
            pool,
        })
    }

    /// Attach a record store.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&dyn RecordStore> {
        self.store.as_deref()
    }

    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    /// Default tile extent, one (Y, X) block of a single channel.
    pub fn tile_shape(&self) -> Shape5 {
        [1, 1, self.config.tile_height, self.config.tile_width, 1]
    }

    /// Resolve a source into an image.
    pub fn open(&self, source: &ImageSource) -> Result<ImageArray, EngineError> {
        assembler::resolve(source, &self.config, self.store())
    }

    pub fn get_metadata(&self, image: &ImageArray) -> MetadataRecord {
        image.metadata()
    }

    pub fn extract_slice(
        &self,
        image: &ImageArray,
        time: usize,
        z: usize,
        channel: usize,
    ) -> Result<Array2<f64>, EngineError> {
        operations::extract_slice(image, time, z, channel, self.tile_shape(), self.pool())
    }

    pub fn compute_statistics(&self, image: &ImageArray) -> Result<StatisticsRecord, EngineError> {
        operations::compute_statistics(image, self.tile_shape(), self.pool())
    }

    /// Fit `n_components` principal components and project the image onto them.
    pub fn fit_transform(
        &self,
        image: &ImageArray,
    ) -> Result<(IncrementalPca, Array5<f64>), EngineError> {
        operations::fit_transform(
            image,
            self.config.n_components,
            self.config.tile_height,
            self.config.tile_width,
            self.config.pca_batch_size,
        )
    }

    pub fn segment(
        &self,
        image: &ImageArray,
        time: usize,
        z: usize,
        channel: usize,
    ) -> Result<Array2<u32>, EngineError> {
        operations::segment(image, time, z, channel, self.tile_shape(), self.pool())
    }

    pub fn encode(&self, image: &ImageArray) -> Result<(Bytes, Descriptor), EngineError> {
        codec::encode(image)
    }

    pub fn decode(&self, data: &[u8], descriptor: &Descriptor) -> Result<ImageArray, EngineError> {
        codec::decode(data, descriptor)
    }

    /// Build the record persisted for `source`.
    pub fn assemble(&self, source: &ImageSource) -> Result<AttributeRecord, EngineError> {
        assembler::assemble(source, &self.config, self.store())
    }

    /// Build the record or metadata for `source`, depending on the configured mode.
    pub fn process(&self, source: &ImageSource) -> Result<ProcessOutput, EngineError> {
        assembler::process(source, &self.config, self.store())
    }

    /// Persist a record in the attached store.
    pub fn store_record(&self, record: &AttributeRecord) -> Result<(), EngineError> {
        self.store().ok_or(EngineError::NoStore)?.put(record)
    }
}
