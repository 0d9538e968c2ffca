//! Command Line Interface (CLI) arguments.

use crate::engine::ProcessMode;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tilestack command line interface
#[derive(Clone, Debug, Parser)]
#[command(name = "tilestack", version, about)]
pub struct CommandLineArgs {
    /// Tile extent along the Height axis
    #[arg(long, default_value_t = 256, env = "TILESTACK_TILE_HEIGHT")]
    pub tile_height: usize,
    /// Tile extent along the Width axis
    #[arg(long, default_value_t = 256, env = "TILESTACK_TILE_WIDTH")]
    pub tile_width: usize,
    /// Minimum number of pixel rows per incremental PCA batch
    #[arg(long, default_value_t = 100_000, env = "TILESTACK_PCA_BATCH_SIZE")]
    pub pca_batch_size: usize,
    /// Number of principal components computed by `analyze`
    #[arg(long, default_value_t = 3, env = "TILESTACK_N_COMPONENTS")]
    pub n_components: usize,
    /// Maximum number of threads used to evaluate tiles. Defaults to the number of CPUs.
    #[arg(long, env = "TILESTACK_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Whether to use Rayon to evaluate tiles in parallel.
    #[arg(long, default_value_t = false, env = "TILESTACK_USE_RAYON")]
    pub use_rayon: bool,
    /// Whether to rebuild images missing from disk using the record store
    #[arg(long, default_value_t = false, env = "TILESTACK_RECONSTRUCT")]
    pub reconstruct: bool,
    /// Output of the `process` command
    #[arg(long, value_enum, default_value_t = ProcessMode::Attributes, env = "TILESTACK_MODE")]
    pub mode: ProcessMode,
    /// Path to the record store
    #[arg(long, env = "TILESTACK_STORE")]
    pub store: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

/// Image to operate on.
#[derive(Args, Clone, Debug)]
pub struct SourceArgs {
    /// Path to a TIFF file, or to raw bytes if `--descriptor` is given
    pub path: PathBuf,
    /// JSON shape/dtype descriptor of the raw bytes at `path`
    #[arg(long)]
    pub descriptor: Option<String>,
}

/// Coordinates of a (Y, X) plane.
#[derive(Args, Clone, Copy, Debug)]
pub struct PlaneArgs {
    #[arg(long, default_value_t = 0)]
    pub time: usize,
    #[arg(long, default_value_t = 0)]
    pub z: usize,
    #[arg(long, default_value_t = 0)]
    pub channel: usize,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print the image's axis extents
    Metadata {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print one (Y, X) plane
    Slice {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        plane: PlaneArgs,
    },
    /// Print per-channel mean, standard deviation, minimum and maximum
    Statistics {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print the image projected onto its principal components
    Analyze {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Print connected component labels of one (Y, X) plane
    Segment {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        plane: PlaneArgs,
    },
    /// Print the record persisted for the image, optionally storing it
    Assemble {
        #[command(flatten)]
        source: SourceArgs,
        /// Store the record in the record store
        #[arg(long, default_value_t = false)]
        save: bool,
    },
    /// Print the record or the metadata of the image, depending on `--mode`
    Process {
        #[command(flatten)]
        source: SourceArgs,
    },
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
