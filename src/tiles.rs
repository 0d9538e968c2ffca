//! Tile geometry.
//!
//! A [TileGrid] partitions a 5D shape into non-overlapping [Region]s whose union is exactly the
//! whole array. Edge tiles are truncated to fit.

use ndarray::{s, ArrayView5, ArrayViewMut5};
use std::ops::Range;

/// Number of image axes.
pub const AXES: usize = 5;

/// A (T, Z, Y, X, C) shape or coordinate.
pub type Shape5 = [usize; AXES];

/// A rectangular sub-block of a 5D array.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Region {
    /// First index on each axis
    pub start: Shape5,
    /// Number of elements on each axis
    pub extent: Shape5,
}

impl Region {
    pub fn new(start: Shape5, extent: Shape5) -> Self {
        Region { start, extent }
    }

    /// The region covering a whole array.
    pub fn full(shape: Shape5) -> Self {
        Region {
            start: [0; AXES],
            extent: shape,
        }
    }

    /// One past the last index on each axis.
    pub fn end(&self) -> Shape5 {
        std::array::from_fn(|axis| self.start[axis] + self.extent[axis])
    }

    pub fn range(&self, axis: usize) -> Range<usize> {
        self.start[axis]..self.start[axis] + self.extent[axis]
    }

    /// Number of elements in the region.
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.contains(&0)
    }

    /// Whether the region lies entirely within an array of `shape`.
    pub fn fits(&self, shape: &Shape5) -> bool {
        self.end().iter().zip(shape).all(|(end, dim)| end <= dim)
    }

    /// The overlap of two regions, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let (self_end, other_end) = (self.end(), other.end());
        let start: Shape5 = std::array::from_fn(|axis| self.start[axis].max(other.start[axis]));
        let end: Shape5 = std::array::from_fn(|axis| self_end[axis].min(other_end[axis]));
        if start.iter().zip(&end).any(|(s, e)| s >= e) {
            return None;
        }
        Some(Region {
            start,
            extent: std::array::from_fn(|axis| end[axis] - start[axis]),
        })
    }

    /// This region expressed relative to the start of `outer`.
    ///
    /// `self` must lie within `outer`.
    pub fn relative_to(&self, outer: &Region) -> Region {
        Region {
            start: std::array::from_fn(|axis| self.start[axis] - outer.start[axis]),
            extent: self.extent,
        }
    }

    /// View of this region of `array`.
    pub fn slice<'a, A>(&self, array: ArrayView5<'a, A>) -> ArrayView5<'a, A> {
        array.slice_move(s![
            self.range(0),
            self.range(1),
            self.range(2),
            self.range(3),
            self.range(4)
        ])
    }

    /// Mutable view of this region of `array`.
    pub fn slice_mut<'a, A>(&self, array: ArrayViewMut5<'a, A>) -> ArrayViewMut5<'a, A> {
        array.slice_move(s![
            self.range(0),
            self.range(1),
            self.range(2),
            self.range(3),
            self.range(4)
        ])
    }
}

/// Partition of a shape into equally sized tiles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TileGrid {
    shape: Shape5,
    tile: Shape5,
}

impl TileGrid {
    /// Returns a new TileGrid.
    ///
    /// Tile extents of zero are treated as one.
    pub fn new(shape: Shape5, tile: Shape5) -> Self {
        TileGrid {
            shape,
            tile: tile.map(|extent| extent.max(1)),
        }
    }

    pub fn shape(&self) -> Shape5 {
        self.shape
    }

    pub fn tile_shape(&self) -> Shape5 {
        self.tile
    }

    /// Number of tiles along each axis.
    pub fn counts(&self) -> Shape5 {
        std::array::from_fn(|axis| self.shape[axis].div_ceil(self.tile[axis]))
    }

    /// Total number of tiles.
    pub fn len(&self) -> usize {
        self.counts().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tile with grid coordinates `index`.
    pub fn tile(&self, index: Shape5) -> Region {
        let start: Shape5 = std::array::from_fn(|axis| index[axis] * self.tile[axis]);
        Region {
            start,
            extent: std::array::from_fn(|axis| {
                self.tile[axis].min(self.shape[axis].saturating_sub(start[axis]))
            }),
        }
    }

    /// All tiles in row-major grid order.
    pub fn tiles(&self) -> impl Iterator<Item = Region> + '_ {
        self.tiles_in([0; AXES], self.counts())
    }

    /// Tiles overlapping `region`, in row-major grid order.
    ///
    /// Only the grid coordinates covering the region are visited, so the cost is proportional to
    /// the number of intersecting tiles rather than the size of the grid.
    pub fn intersecting(&self, region: &Region) -> impl Iterator<Item = Region> + '_ {
        let end = region.end();
        let first: Shape5 = std::array::from_fn(|axis| region.start[axis] / self.tile[axis]);
        let last: Shape5 = std::array::from_fn(|axis| {
            end[axis]
                .min(self.shape[axis])
                .div_ceil(self.tile[axis])
                .max(first[axis])
        });
        let counts = if region.is_empty() {
            [0; AXES]
        } else {
            std::array::from_fn(|axis| last[axis] - first[axis])
        };
        self.tiles_in(first, counts)
    }

    fn tiles_in(&self, first: Shape5, counts: Shape5) -> impl Iterator<Item = Region> + '_ {
        ndarray::indices(counts)
            .into_iter()
            .map(move |(t, z, y, x, c)| {
                self.tile([
                    first[0] + t,
                    first[1] + z,
                    first[2] + y,
                    first[3] + x,
                    first[4] + c,
                ])
            })
    }
}
