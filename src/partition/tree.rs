//! The partition tree: an arena of nodes in pre-order whose leaves are the regions.
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{Error, Result},
    partition::{
        assignment::{Assignment, AssignmentPolicy},
        tables::RegionTables,
    },
    types::{bounds::Bounds, dataset::Coordinate},
};

/// Values per node in the packed representation.
const PACKED_NODE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Points with `point[dim] < value` are left, `> value` right. Points on the plane go
    /// left when `equal_left` is set.
    Internal {
        dim: usize,
        value: f64,
        equal_left: bool,
        left: usize,
        right: usize,
    },
    Leaf {
        region: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub bounds: Bounds,
    pub kind: NodeKind,
}

/// A leaf of the tree together with its current owner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialRegion {
    pub id: usize,
    pub bounds: Bounds,
    pub owner: Option<usize>,
}

/// Classify a coordinate against a split plane.
pub(crate) fn goes_left(coordinate: f64, value: f64, equal_left: bool) -> bool {
    coordinate < value || (equal_left && coordinate == value)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTree {
    nodes: Vec<Node>,
    /// Node index of each region.
    regions: Vec<usize>,
    assignment: Option<Assignment>,
    #[serde(skip)]
    tables: Option<RegionTables>,
}

impl PartitionTree {
    /// Wrap pre-ordered nodes. Leaves must be numbered `0..R` in traversal order.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::NoTree);
        }
        let mut regions = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            match node.kind {
                NodeKind::Leaf { region } => {
                    if region != regions.len() {
                        return Err(Error::InvalidRegion(region));
                    }
                    regions.push(index);
                }
                NodeKind::Internal { dim, left, right, .. } => {
                    if dim >= 3 {
                        return Err(Error::Decode(format!(
                            "node {} splits dimension {}",
                            index, dim
                        )));
                    }
                    if left <= index || right <= index || left >= nodes.len() || right >= nodes.len() {
                        return Err(Error::NoTree);
                    }
                }
            }
        }
        Ok(PartitionTree {
            nodes,
            regions,
            assignment: None,
            tables: None,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Bounds of all regions together.
    pub fn bounds(&self) -> Bounds {
        self.nodes[0].bounds
    }

    pub fn number_of_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn region_bounds(&self, region: usize) -> Result<Bounds> {
        self.regions
            .get(region)
            .map(|&node| self.nodes[node].bounds)
            .ok_or(Error::InvalidRegion(region))
    }

    pub fn region(&self, region: usize) -> Result<SpatialRegion> {
        Ok(SpatialRegion {
            id: region,
            bounds: self.region_bounds(region)?,
            owner: self.assignment.as_ref().and_then(|a| a.owner(region)),
        })
    }

    /// Levels below the root.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            if let NodeKind::Internal { left, right, .. } = self.nodes[node].kind {
                stack.push((left, depth + 1));
                stack.push((right, depth + 1));
            }
        }
        deepest
    }

    /// Region whose split planes classify `point`, wherever it lies.
    pub fn locate(&self, point: &Coordinate) -> usize {
        let mut node = 0;
        loop {
            match self.nodes[node].kind {
                NodeKind::Internal {
                    dim,
                    value,
                    equal_left,
                    left,
                    right,
                } => {
                    node = if goes_left(point[dim], value, equal_left) {
                        left
                    } else {
                        right
                    }
                }
                NodeKind::Leaf { region } => return region,
            }
        }
    }

    /// Region containing `point`, `None` outside the tree's bounds.
    pub fn region_containing_point(&self, point: &Coordinate) -> Option<usize> {
        self.bounds().contains(point).then(|| self.locate(point))
    }

    /// Regions whose closed bounds intersect `bounds`.
    pub fn regions_intersecting(&self, bounds: &Bounds) -> Vec<usize> {
        let mut found = Vec::new();
        let mut stack = vec![0];
        while let Some(node) = stack.pop() {
            if !self.nodes[node].bounds.intersects(bounds) {
                continue;
            }
            match self.nodes[node].kind {
                NodeKind::Internal { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
                NodeKind::Leaf { region } => found.push(region),
            }
        }
        found
    }

    /// Flatten into `[node count, 12 values per node]` for broadcasting.
    pub fn pack(&self) -> Vec<f64> {
        let mut packed = Vec::with_capacity(1 + PACKED_NODE_LEN * self.nodes.len());
        packed.push(self.nodes.len() as f64);
        for node in self.nodes.iter() {
            let (dim, value, equal_left, left, right, region) = match node.kind {
                NodeKind::Internal {
                    dim,
                    value,
                    equal_left,
                    left,
                    right,
                } => (dim as f64, value, equal_left as u8 as f64, left as f64, right as f64, -1.),
                NodeKind::Leaf { region } => (-1., 0., 0., 0., 0., region as f64),
            };
            packed.extend_from_slice(&[dim, value, equal_left, left, right, region]);
            packed.extend_from_slice(&node.bounds.min);
            packed.extend_from_slice(&node.bounds.max);
        }
        packed
    }

    /// Inverse of [`pack`](Self::pack). An empty buffer means no tree was built; anything
    /// else that is not a packed tree is rejected.
    pub fn unpack(packed: &[f64]) -> Result<Self> {
        let Some(&count) = packed.first() else {
            return Err(Error::NoTree);
        };
        if !(count >= 1. && count.fract() == 0.) {
            return Err(Error::Decode(format!("node count {}", count)));
        }
        let expected = (PACKED_NODE_LEN as u64)
            .checked_mul(count as u64)
            .and_then(|n| n.checked_add(1));
        if expected != Some(packed.len() as u64) {
            return Err(Error::Decode(format!(
                "{} values cannot hold {} nodes",
                packed.len(),
                count
            )));
        }
        if packed[1..].iter().any(|v| !v.is_finite()) {
            return Err(Error::Decode(String::from("non-finite value")));
        }
        let nodes = packed[1..]
            .chunks_exact(PACKED_NODE_LEN)
            .map(|v| {
                // Negative indices saturate to 0 and are caught by `from_nodes`.
                let kind = if v[0] < 0. {
                    NodeKind::Leaf { region: v[5] as usize }
                } else {
                    NodeKind::Internal {
                        dim: v[0] as usize,
                        value: v[1],
                        equal_left: v[2] != 0.,
                        left: v[3] as usize,
                        right: v[4] as usize,
                    }
                };
                Node {
                    bounds: Bounds::new([v[6], v[7], v[8]], [v[9], v[10], v[11]]),
                    kind,
                }
            })
            .collect();
        PartitionTree::from_nodes(nodes)
    }

    pub fn tables(&self) -> Option<&RegionTables> {
        self.tables.as_ref()
    }

    pub fn set_tables(&mut self, tables: RegionTables) {
        self.tables = Some(tables);
    }

    /// Recompute region ownership. A failing policy leaves the previous assignment in place.
    pub fn assign_regions(&mut self, policy: &AssignmentPolicy, nprocs: usize) -> Result<()> {
        match Assignment::compute(policy, self.number_of_regions(), nprocs) {
            Ok(assignment) => {
                self.assignment = Some(assignment);
                Ok(())
            }
            Err(e) => {
                warn!("region assignment failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    fn assigned(&self) -> Result<&Assignment> {
        self.assignment
            .as_ref()
            .ok_or_else(|| Error::InvalidAssignment("regions have not been assigned".to_string()))
    }

    /// Owner per region id.
    pub fn assignment_map(&self) -> Result<&[usize]> {
        Ok(self.assigned()?.owners())
    }

    pub fn process_assigned_to_region(&self, region: usize) -> Result<usize> {
        self.assigned()?
            .owner(region)
            .ok_or(Error::InvalidRegion(region))
    }

    pub fn region_assignment_list(&self, process: usize) -> Result<&[usize]> {
        self.assigned()?
            .regions_of(process)
            .ok_or(Error::InvalidProcess(process as crate::comm::Rank))
    }

    /// Region owners front to back, each listed once, as seen from `eye`.
    pub fn view_order_from_position(&self, eye: &Coordinate) -> Result<Vec<usize>> {
        self.view_order(|dim, value| eye[dim] < value)
    }

    /// Region owners front to back, each listed once, looking along `direction`.
    pub fn view_order_in_direction(&self, direction: &Coordinate) -> Result<Vec<usize>> {
        self.view_order(|dim, _| direction[dim] > 0.)
    }

    fn view_order(&self, left_first: impl Fn(usize, f64) -> bool) -> Result<Vec<usize>> {
        let assignment = self.assigned()?;
        let mut seen = vec![false; assignment.number_of_processes()];
        let mut order = Vec::new();
        let mut stack = vec![0];
        while let Some(node) = stack.pop() {
            match self.nodes[node].kind {
                NodeKind::Internal {
                    dim,
                    value,
                    left,
                    right,
                    ..
                } => {
                    if left_first(dim, value) {
                        stack.push(right);
                        stack.push(left);
                    } else {
                        stack.push(left);
                        stack.push(right);
                    }
                }
                NodeKind::Leaf { region } => {
                    if let Some(owner) = assignment.owner(region) {
                        if !seen[owner] {
                            seen[owner] = true;
                            order.push(owner);
                        }
                    }
                }
            }
        }
        Ok(order)
    }
}
