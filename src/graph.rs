//! Lazy tile computation graph.
//!
//! A [TileGraph] is an arena of [Node]s. Nodes refer to their inputs by [NodeId], and an input
//! always has a lower id than the node consuming it, so the arena order is a topological order.
//! Nothing is read from the [TileSource] until [TileGraph::compute] is called, and then only the
//! tiles reachable from the requested root.

use crate::error::EngineError;
use crate::source::TileSource;
use crate::tiles::Region;

use ndarray::{Array5, Axis};
use rayon::prelude::*;
use rayon::ThreadPool;

/// Index of a node within a [TileGraph].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A step in a tile computation.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Read one region from the source.
    Tile(Region),
    /// Reduce a dense tile to per-channel partial accumulators.
    Accumulate { input: NodeId },
    /// Merge partial accumulators.
    Combine { inputs: Vec<NodeId> },
    /// Assemble dense tiles into one array covering `region`.
    Stitch { region: Region, inputs: Vec<NodeId> },
}

/// Partial reduction of one channel: count, mean, sum of squared deviations (M2), min and max.
///
/// Partials are merged with the pairwise update of Chan et al., so the standard deviation stays
/// accurate for values far from zero whatever the tiling.
///
/// A NaN value propagates into the mean, the standard deviation, the minimum and the maximum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Accumulator {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

/// `f64::min`, except that NaN wins.
fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

/// `f64::max`, except that NaN wins.
fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

impl Accumulator {
    /// Add one value.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = nan_min(self.min, value);
        self.max = nan_max(self.max, value);
    }

    /// Merge two accumulators. The operation is associative and commutative.
    pub fn merge(&self, other: &Accumulator) -> Accumulator {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        let (n_a, n_b) = (self.count as f64, other.count as f64);
        let n = n_a + n_b;
        let delta = other.mean - self.mean;
        Accumulator {
            count: self.count + other.count,
            mean: (n_a * self.mean + n_b * other.mean) / n,
            m2: (self.m2 + other.m2) + delta * delta * n_a * n_b / n,
            min: nan_min(self.min, other.min),
            max: nan_max(self.max, other.max),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Mean, clamped into `[min, max]` to absorb rounding.
    pub fn mean(&self) -> f64 {
        if self.min <= self.max {
            self.mean.clamp(self.min, self.max)
        } else {
            self.mean
        }
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }
}

/// One [Accumulator] per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Partials(pub Vec<Accumulator>);

impl Partials {
    pub fn empty(channels: usize) -> Self {
        Partials(vec![Accumulator::default(); channels])
    }

    /// Accumulate the values of a dense tile starting at `region`.
    fn from_dense(
        node: NodeId,
        channels: usize,
        region: &Region,
        data: &Array5<f64>,
    ) -> Result<Partials, EngineError> {
        let mut partials = Partials::empty(channels);
        for (offset, lane) in data.axis_iter(Axis(4)).enumerate() {
            let accumulator = partials.0.get_mut(region.start[4] + offset).ok_or(
                EngineError::InvalidGraph {
                    node: node.0,
                    reason: "tile channel outside graph channels",
                },
            )?;
            lane.iter().for_each(|value| accumulator.push(*value));
        }
        Ok(partials)
    }

    /// Merge channel by channel.
    pub fn merge(&self, other: &Partials) -> Partials {
        Partials(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| a.merge(b))
                .collect(),
        )
    }
}

/// Result of evaluating a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Dense { region: Region, data: Array5<f64> },
    Partial(Partials),
}

impl Value {
    pub fn into_partials(self, node: NodeId) -> Result<Partials, EngineError> {
        match self {
            Value::Partial(partials) => Ok(partials),
            Value::Dense { .. } => Err(EngineError::InvalidGraph {
                node: node.0,
                reason: "expected partial accumulators",
            }),
        }
    }

    pub fn into_dense(self, node: NodeId) -> Result<(Region, Array5<f64>), EngineError> {
        match self {
            Value::Dense { region, data } => Ok((region, data)),
            Value::Partial(_) => Err(EngineError::InvalidGraph {
                node: node.0,
                reason: "expected a dense tile",
            }),
        }
    }
}

/// Arena of tile computation nodes.
#[derive(Clone, Debug, Default)]
pub struct TileGraph {
    nodes: Vec<Node>,
    channels: usize,
}

impl TileGraph {
    /// Returns an empty graph for an array with `channels` channels.
    pub fn new(channels: usize) -> Self {
        TileGraph {
            nodes: vec![],
            channels,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Append a node. Every input must already be in the graph.
    pub fn add(&mut self, node: Node) -> Result<NodeId, EngineError> {
        let id = self.nodes.len();
        let inputs: &[NodeId] = match &node {
            Node::Tile(_) => &[],
            Node::Accumulate { input } => std::slice::from_ref(input),
            Node::Combine { inputs } | Node::Stitch { inputs, .. } => inputs,
        };
        if inputs.iter().any(|input| input.0 >= id) {
            return Err(EngineError::InvalidGraph {
                node: id,
                reason: "input is not an earlier node",
            });
        }
        self.nodes.push(node);
        Ok(NodeId(id))
    }

    pub fn tile(&mut self, region: Region) -> NodeId {
        self.nodes.push(Node::Tile(region));
        NodeId(self.nodes.len() - 1)
    }

    pub fn accumulate(&mut self, input: NodeId) -> Result<NodeId, EngineError> {
        self.add(Node::Accumulate { input })
    }

    pub fn combine(&mut self, inputs: Vec<NodeId>) -> Result<NodeId, EngineError> {
        self.add(Node::Combine { inputs })
    }

    pub fn stitch(&mut self, region: Region, inputs: Vec<NodeId>) -> Result<NodeId, EngineError> {
        self.add(Node::Stitch { region, inputs })
    }

    /// Evaluate the subgraph rooted at `root`.
    ///
    /// With a thread pool, the inputs of each `Combine` node are evaluated in parallel. The first
    /// failing tile aborts the computation.
    ///
    /// # Arguments
    ///
    /// * `root`: Node to evaluate
    /// * `source`: Storage the tiles are read from
    /// * `pool`: Optional thread pool for parallel evaluation
    pub fn compute(
        &self,
        root: NodeId,
        source: &dyn TileSource,
        pool: Option<&ThreadPool>,
    ) -> Result<Value, EngineError> {
        match pool {
            Some(pool) => pool.install(|| self.evaluate(root, source, true)),
            None => self.evaluate(root, source, false),
        }
    }

    fn evaluate(
        &self,
        id: NodeId,
        source: &dyn TileSource,
        parallel: bool,
    ) -> Result<Value, EngineError> {
        let node = self.nodes.get(id.0).ok_or(EngineError::InvalidGraph {
            node: id.0,
            reason: "no such node",
        })?;
        match node {
            Node::Tile(region) => Ok(Value::Dense {
                region: *region,
                data: source.read_region(region)?,
            }),
            Node::Accumulate { input } => {
                let (region, data) = self.evaluate(*input, source, parallel)?.into_dense(id)?;
                Partials::from_dense(id, self.channels, &region, &data).map(Value::Partial)
            }
            Node::Combine { inputs } => {
                let partials = |input: &NodeId| {
                    self.evaluate(*input, source, parallel)?
                        .into_partials(*input)
                };
                let identity = Partials::empty(self.channels);
                let combined = if parallel {
                    inputs
                        .par_iter()
                        .map(partials)
                        .try_reduce(|| identity.clone(), |a, b| Ok(a.merge(&b)))?
                } else {
                    inputs.iter().try_fold(identity, |acc, input| {
                        partials(input).map(|partial| acc.merge(&partial))
                    })?
                };
                Ok(Value::Partial(combined))
            }
            Node::Stitch { region, inputs } => {
                let mut result = Array5::<f64>::zeros(region.extent);
                let mut covered = 0;
                for input in inputs {
                    let (tile, data) = self.evaluate(*input, source, parallel)?.into_dense(*input)?;
                    if let Some(overlap) = tile.intersection(region) {
                        overlap
                            .relative_to(region)
                            .slice_mut(result.view_mut())
                            .assign(&overlap.relative_to(&tile).slice(data.view()));
                        covered += overlap.len();
                    }
                }
                if covered != region.len() {
                    return Err(EngineError::InvalidGraph {
                        node: id.0,
                        reason: "inputs do not cover the stitched region",
                    });
                }
                Ok(Value::Dense {
                    region: *region,
                    data: result,
                })
            }
        }
    }
}
