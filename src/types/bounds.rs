//! Axis-aligned bounding boxes.
use serde::{Deserialize, Serialize};

use crate::{
    comm::Communicator,
    subgroup::SubGroup,
    types::dataset::Coordinate,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds::empty()
    }
}

impl Bounds {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Bounds { min, max }
    }

    /// An inverted box that any point will grow.
    pub fn empty() -> Self {
        Bounds {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    pub fn from_points(points: &[Coordinate]) -> Self {
        let mut bounds = Bounds::empty();
        for point in points {
            bounds.add_point(point);
        }
        bounds
    }

    /// Bounds of points distributed over the members of `group`, identical on every member.
    pub fn from_global_points<C: Communicator>(points: &[Coordinate], group: &SubGroup<C>) -> Self {
        let local = Bounds::from_points(points);
        let min = group.all_reduce_min(&local.min);
        let max = group.all_reduce_max(&local.max);
        Bounds {
            min: [min[0], min[1], min[2]],
            max: [max[0], max[1], max[2]],
        }
    }

    pub fn add_point(&mut self, point: &Coordinate) {
        for dim in 0..3 {
            self.min[dim] = self.min[dim].min(point[dim]);
            self.max[dim] = self.max[dim].max(point[dim]);
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        let mut result = *self;
        for dim in 0..3 {
            result.min[dim] = result.min[dim].min(other.min[dim]);
            result.max[dim] = result.max[dim].max(other.max[dim]);
        }
        result
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|dim| self.min[dim] <= self.max[dim])
    }

    pub fn extent(&self, dim: usize) -> f64 {
        (self.max[dim] - self.min[dim]).max(0.)
    }

    pub fn diameter(&self) -> [f64; 3] {
        [self.extent(0), self.extent(1), self.extent(2)]
    }

    pub fn center(&self) -> Coordinate {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    /// Closed-box containment.
    pub fn contains(&self, point: &Coordinate) -> bool {
        (0..3).all(|dim| self.min[dim] <= point[dim] && point[dim] <= self.max[dim])
    }

    /// True when the closed boxes share at least one point.
    pub fn intersects(&self, other: &Bounds) -> bool {
        (0..3).all(|dim| self.min[dim] <= other.max[dim] && other.min[dim] <= self.max[dim])
    }

    /// Dimensions ordered by decreasing extent. A box with no extent at all falls back to
    /// round robin starting at `depth % 3`.
    pub fn dimensions_by_extent(&self, depth: usize) -> [usize; 3] {
        let diameter = self.diameter();
        if diameter.iter().all(|&d| d <= 0.) {
            let first = depth % 3;
            return [first, (first + 1) % 3, (first + 2) % 3];
        }
        let mut dims = [0, 1, 2];
        dims.sort_by(|&a, &b| diameter[b].total_cmp(&diameter[a]));
        dims
    }

    /// Cut the box at `value` along `dim`; both halves share the cutting plane.
    pub fn split(&self, dim: usize, value: f64) -> (Bounds, Bounds) {
        let mut lower = *self;
        let mut upper = *self;
        lower.max[dim] = value;
        upper.min[dim] = value;
        (lower, upper)
    }

    /// Corners in VTK voxel order.
    pub fn corners(&self) -> [Coordinate; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            [lo[0], lo[1], lo[2]],
            [hi[0], lo[1], lo[2]],
            [lo[0], hi[1], lo[2]],
            [hi[0], hi[1], lo[2]],
            [lo[0], lo[1], hi[2]],
            [hi[0], lo[1], hi[2]],
            [lo[0], hi[1], hi[2]],
            [hi[0], hi[1], hi[2]],
        ]
    }
}
