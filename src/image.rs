//! Validated 5D images and lazy tiled views of them.

use crate::error::EngineError;
use crate::graph::{NodeId, Partials, TileGraph, Value};
use crate::models::{AxisName, DType, MetadataRecord};
use crate::source::{self, MemorySource, TiffSource, TileSource};
use crate::tiles::{Region, Shape5, TileGrid};
use crate::validate::validate;

use hashbrown::HashMap;
use ndarray::{Array2, Array5};
use rayon::ThreadPool;
use std::path::Path;
use std::sync::Arc;

/// A (T, Z, Y, X, C) image backed by a [TileSource].
///
/// The shape is validated on construction, whatever the origin of the data. The image is
/// immutable and cheap to clone.
#[derive(Clone, Debug)]
pub struct ImageArray {
    source: Arc<dyn TileSource>,
    metadata: MetadataRecord,
}

impl ImageArray {
    /// Wrap a tile source, rejecting shapes without exactly five axes.
    pub fn new(source: Arc<dyn TileSource>) -> Result<Self, EngineError> {
        let metadata = validate(source.shape())?;
        Ok(ImageArray { source, metadata })
    }

    /// Open a TIFF file lazily.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        Self::new(Arc::new(TiffSource::open(path)?))
    }

    /// Build an image from an in-memory source.
    pub fn from_memory(source: MemorySource) -> Result<Self, EngineError> {
        Self::new(Arc::new(source))
    }

    pub fn metadata(&self) -> MetadataRecord {
        self.metadata
    }

    pub fn shape(&self) -> Shape5 {
        self.metadata.shape()
    }

    pub fn dtype(&self) -> DType {
        self.source.dtype()
    }

    pub fn source(&self) -> &dyn TileSource {
        self.source.as_ref()
    }

    /// A lazy view of this image split into tiles of `tile` extent.
    pub fn tiled(&self, tile: Shape5) -> LazyArray {
        LazyArray::new(self.clone(), tile)
    }
}

/// A tiled image together with the computation graph built over it.
///
/// Methods such as [LazyArray::plane] only add nodes to the graph. Nothing is read until
/// [LazyArray::compute] is called.
#[derive(Debug)]
pub struct LazyArray {
    image: ImageArray,
    grid: TileGrid,
    graph: TileGraph,
    tiles: HashMap<Region, NodeId>,
}

impl LazyArray {
    pub fn new(image: ImageArray, tile: Shape5) -> Self {
        let grid = TileGrid::new(image.shape(), tile);
        let graph = TileGraph::new(image.metadata.channels);
        LazyArray {
            image,
            grid,
            graph,
            tiles: HashMap::new(),
        }
    }

    pub fn image(&self) -> &ImageArray {
        &self.image
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn graph(&self) -> &TileGraph {
        &self.graph
    }

    /// Node reading `region`, shared between all users of the same tile.
    fn tile_node(&mut self, region: Region) -> NodeId {
        let graph = &mut self.graph;
        *self
            .tiles
            .entry(region)
            .or_insert_with(|| graph.tile(region))
    }

    /// Lazily read `region` as a single tile.
    pub fn tile(&mut self, region: Region) -> Result<NodeId, EngineError> {
        source::check_region(&region, &self.image.shape())?;
        Ok(self.tile_node(region))
    }

    /// Lazily select `region`, touching only the tiles it intersects.
    pub fn slice(&mut self, region: Region) -> Result<NodeId, EngineError> {
        source::check_region(&region, &self.image.shape())?;
        let tiles: Vec<Region> = self.grid.intersecting(&region).collect();
        let inputs = tiles
            .into_iter()
            .map(|tile| self.tile_node(tile))
            .collect();
        self.graph.stitch(region, inputs)
    }

    /// Lazily select the (Y, X) plane at fixed time, depth and channel.
    pub fn plane(&mut self, time: usize, z: usize, channel: usize) -> Result<NodeId, EngineError> {
        let shape = self.image.shape();
        for (axis, index) in [
            (AxisName::Time, time),
            (AxisName::Depth, z),
            (AxisName::Channel, channel),
        ] {
            let extent = shape[axis.index()];
            if index >= extent {
                return Err(EngineError::IndexOutOfRange {
                    axis,
                    index,
                    extent,
                });
            }
        }
        self.slice(Region::new(
            [time, z, 0, 0, channel],
            [1, 1, shape[2], shape[3], 1],
        ))
    }

    /// Lazily reduce every tile to per-channel accumulators and combine them.
    pub fn reduce(&mut self) -> Result<NodeId, EngineError> {
        let tiles: Vec<Region> = self.grid.tiles().collect();
        let partials = tiles
            .into_iter()
            .map(|tile| {
                let tile = self.tile_node(tile);
                self.graph.accumulate(tile)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.graph.combine(partials)
    }

    /// Evaluate `node`.
    pub fn compute(&self, node: NodeId, pool: Option<&ThreadPool>) -> Result<Value, EngineError> {
        self.graph.compute(node, self.image.source(), pool)
    }

    /// Evaluate a node producing dense values.
    pub fn compute_dense(
        &self,
        node: NodeId,
        pool: Option<&ThreadPool>,
    ) -> Result<Array5<f64>, EngineError> {
        Ok(self.compute(node, pool)?.into_dense(node)?.1)
    }

    /// Evaluate a node built by [LazyArray::plane] into a (Y, X) array.
    pub fn compute_plane(
        &self,
        node: NodeId,
        pool: Option<&ThreadPool>,
    ) -> Result<Array2<f64>, EngineError> {
        let (region, data) = self.compute(node, pool)?.into_dense(node)?;
        Ok(data.into_shape((region.extent[2], region.extent[3]))?)
    }

    /// Evaluate a node built by [LazyArray::reduce].
    pub fn compute_partials(
        &self,
        node: NodeId,
        pool: Option<&ThreadPool>,
    ) -> Result<Partials, EngineError> {
        self.compute(node, pool)?.into_partials(node)
    }
}
