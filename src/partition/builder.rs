//! Breadth-first construction of a balanced partition tree over distributed points.
//!
//! Steps:
//! ------
//! 0) Drop ghost points unless requested, give empty processes a placeholder point.
//! 1) For every node of the current level, find the split value with a distributed
//!    quickselect over the processes sharing the node.
//! 2) Move each node's points so that its left child's points live on the lower part of
//!    its process range and the right child's on the upper part. Children then run their
//!    collectives on disjoint sub-groups.
//! 3) Once a node's range is a single process, the rest of its subtree is built locally.
//! 4) Node records are gathered on rank 0, assembled into the tree and broadcast.
use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::{
    comm::{Communicator, Rank, Scalar},
    config::BuildConfig,
    constants::{BUILD_TAG, TREE_BROADCAST_TAG},
    error::{Error, Result},
    partition::{
        select::{select_kth, Selection},
        tables::RegionTables,
        tree::{goes_left, Node, NodeKind, PartitionTree},
    },
    subgroup::SubGroup,
    types::{bounds::Bounds, dataset::Coordinate},
};

/// Bytes per encoded node record.
const RECORD_LEN: usize = 10 * 8;

/// One node as decided by the first process of its range. Ids are heap ids: the root is
/// 0 and the children of `id` are `2 id + 1` and `2 id + 2`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct NodeRecord {
    id: u64,
    /// Split dimension, `None` for a leaf.
    dim: Option<usize>,
    value: f64,
    equal_left: bool,
    bounds: Bounds,
}

impl NodeRecord {
    fn write(&self, out: &mut Vec<u8>) {
        self.id.write_le(out);
        self.dim.map_or(-1i64, |d| d as i64).write_le(out);
        self.value.write_le(out);
        u64::from(self.equal_left).write_le(out);
        for v in self.bounds.min.iter().chain(self.bounds.max.iter()) {
            v.write_le(out);
        }
    }

    fn read(bytes: &[u8]) -> Self {
        let f = |i: usize| f64::read_le(&bytes[8 * i..]);
        let dim = i64::read_le(&bytes[8..]);
        NodeRecord {
            id: u64::read_le(bytes),
            dim: (dim >= 0).then_some(dim as usize),
            value: f(2),
            equal_left: u64::read_le(&bytes[24..]) != 0,
            bounds: Bounds::new([f(4), f(5), f(6)], [f(7), f(8), f(9)]),
        }
    }
}

/// A node still to be decided, held by every process of its range.
struct WorkItem {
    id: u64,
    depth: usize,
    bounds: Bounds,
    /// Regions this subtree should end up with.
    leaves: usize,
    lo: Rank,
    hi: Rank,
    points: Vec<Coordinate>,
}

impl WorkItem {
    fn leaf(&self) -> NodeRecord {
        NodeRecord {
            id: self.id,
            dim: None,
            value: 0.,
            equal_left: false,
            bounds: self.bounds,
        }
    }
}

/// Pick the side that takes the points equal to the selected value, landing the left count
/// as close to `target` as possible while keeping both sides non-empty.
fn choose_split(selection: &Selection, target: u64, total: u64) -> Option<bool> {
    let valid = |count: u64| count >= 1 && count < total;
    let below = selection.below;
    let at_or_below = selection.total_at_or_below();
    match (valid(below), valid(at_or_below)) {
        (true, true) => Some(at_or_below.abs_diff(target) < below.abs_diff(target)),
        (true, false) => Some(false),
        (false, true) => Some(true),
        (false, false) => None,
    }
}

/// Index of the part receiving element `index` out of `total`, split into `parts`.
fn spread(index: u64, total: u64, parts: usize) -> usize {
    ((index as u128 * parts as u128) / total.max(1) as u128) as usize
}

fn unflatten(values: &[f64]) -> impl Iterator<Item = Coordinate> + '_ {
    values.chunks_exact(3).map(|c| [c[0], c[1], c[2]])
}

fn assemble(records: &HashMap<u64, NodeRecord>) -> Option<Vec<Node>> {
    fn push(
        id: u64,
        records: &HashMap<u64, NodeRecord>,
        nodes: &mut Vec<Node>,
        next_region: &mut usize,
    ) -> Option<usize> {
        let record = records.get(&id)?;
        let index = nodes.len();
        nodes.push(Node {
            bounds: record.bounds,
            kind: NodeKind::Leaf { region: 0 },
        });
        nodes[index].kind = match record.dim {
            None => {
                *next_region += 1;
                NodeKind::Leaf {
                    region: *next_region - 1,
                }
            }
            Some(dim) => {
                let left = push(2 * id + 1, records, nodes, next_region)?;
                let right = push(2 * id + 2, records, nodes, next_region)?;
                NodeKind::Internal {
                    dim,
                    value: record.value,
                    equal_left: record.equal_left,
                    left,
                    right,
                }
            }
        };
        Some(index)
    }

    let mut nodes = Vec::with_capacity(records.len());
    let mut next_region = 0;
    push(0, records, &mut nodes, &mut next_region)?;
    Some(nodes)
}

pub struct PartitionTreeBuilder {
    config: BuildConfig,
}

impl PartitionTreeBuilder {
    pub fn new(config: BuildConfig) -> Self {
        PartitionTreeBuilder { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build a tree over the points of every process in `comm` and the region tables
    /// describing where the points live. Collective over `comm`.
    ///
    /// `ghost` flags the ghost points, it may be empty when there are none.
    pub fn build_locator<C: Communicator>(
        &self,
        comm: &C,
        points: &[Coordinate],
        ghost: &[bool],
    ) -> Result<PartitionTree> {
        let world = SubGroup::whole(comm, BUILD_TAG)?;
        let nprocs = world.members();

        let mut local: Vec<Coordinate> = points
            .iter()
            .enumerate()
            .filter(|(i, _)| self.config.include_ghost_cells || !ghost.get(*i).copied().unwrap_or(false))
            .map(|(_, p)| *p)
            .collect();

        let total = world.all_reduce_sum(&[local.len() as u64])[0];
        if total == 0 {
            warn!("partition tree requested over an empty dataset");
            return Err(Error::EmptyDataset);
        }

        let bounds = Bounds::from_global_points(&local, &world);
        if local.is_empty() {
            local.push(bounds.min);
        }

        let nregions = self.config.number_of_regions.unwrap_or(nprocs).max(1);
        debug!(nprocs, total, nregions, "building partition tree");

        let mut records = Vec::new();
        let mut level = vec![WorkItem {
            id: 0,
            depth: 0,
            bounds,
            leaves: nregions,
            lo: 0,
            hi: nprocs as Rank - 1,
            points: local,
        }];
        while !level.is_empty() {
            let mut next = Vec::new();
            for item in level {
                self.split_node(comm, item, &mut records, &mut next)?;
            }
            level = next;
        }

        let mut tree = Self::share_tree(comm, &records)?;
        debug!(
            regions = tree.number_of_regions(),
            depth = tree.depth(),
            "partition tree built"
        );

        let tables = RegionTables::build(comm, &tree, points, ghost, self.config.include_ghost_cells)?;
        tree.set_tables(tables);
        Ok(tree)
    }

    /// Decide one node. Children that involve this process are pushed onto `next`.
    fn split_node<C: Communicator>(
        &self,
        comm: &C,
        item: WorkItem,
        records: &mut Vec<NodeRecord>,
        next: &mut Vec<WorkItem>,
    ) -> Result<()> {
        let group = SubGroup::new(comm, item.lo, item.hi, BUILD_TAG)?;
        let first = group.member_rank() == 0;

        let total = group.all_reduce_sum(&[item.points.len() as u64])[0];
        let tight = Bounds::from_global_points(&item.points, &group);

        // Dimensions along which the node's points actually differ.
        let dim = if item.leaves > 1 && total > 1 {
            item.bounds
                .dimensions_by_extent(item.depth)
                .into_iter()
                .find(|&d| tight.extent(d) > 0.)
        } else {
            None
        };

        let Some(dim) = dim else {
            if first {
                records.push(item.leaf());
            }
            return Ok(());
        };

        let left_leaves = (item.leaves + 1) / 2;
        let target = ((total as f64 * left_leaves as f64 / item.leaves as f64).round() as u64)
            .clamp(1, total - 1);
        let coordinates: Vec<f64> = item.points.iter().map(|p| p[dim]).collect();

        let split = select_kth(&group, &coordinates, target - 1)
            .and_then(|s| choose_split(&s, target, total).map(|equal_left| (s.value, equal_left)));
        let Some((value, equal_left)) = split else {
            if first {
                records.push(item.leaf());
            }
            return Ok(());
        };

        trace!(id = item.id, dim, value, equal_left, total, target, "split");
        if first {
            records.push(NodeRecord {
                id: item.id,
                dim: Some(dim),
                value,
                equal_left,
                bounds: item.bounds,
            });
        }

        let (left_bounds, right_bounds) = item.bounds.split(dim, value);
        let (left_points, right_points): (Vec<Coordinate>, Vec<Coordinate>) = item
            .points
            .into_iter()
            .partition(|p| goes_left(p[dim], value, equal_left));

        let child = |id, bounds, leaves, lo, hi, points| WorkItem {
            id,
            depth: item.depth + 1,
            bounds,
            leaves,
            lo,
            hi,
            points,
        };

        let np = group.members();
        if np == 1 {
            next.push(child(2 * item.id + 1, left_bounds, left_leaves, item.lo, item.hi, left_points));
            next.push(child(
                2 * item.id + 2,
                right_bounds,
                item.leaves - left_leaves,
                item.lo,
                item.hi,
                right_points,
            ));
            return Ok(());
        }

        let lp = ((np as f64 * left_leaves as f64 / item.leaves as f64).round() as usize).clamp(1, np - 1);
        let moved = Self::move_points(&group, &left_points, &right_points, lp);
        let me = group.member_rank();
        if me < lp {
            next.push(child(
                2 * item.id + 1,
                left_bounds,
                left_leaves,
                item.lo,
                item.lo + lp as Rank - 1,
                moved,
            ));
        } else {
            next.push(child(
                2 * item.id + 2,
                right_bounds,
                item.leaves - left_leaves,
                item.lo + lp as Rank,
                item.hi,
                moved,
            ));
        }
        Ok(())
    }

    /// Spread left points evenly over members `0..lp` and right points over `lp..`,
    /// keeping the global order of each side.
    fn move_points<C: Communicator>(
        group: &SubGroup<C>,
        left: &[Coordinate],
        right: &[Coordinate],
        lp: usize,
    ) -> Vec<Coordinate> {
        let np = group.members();
        let counts = group.all_gather(&[left.len() as u64, right.len() as u64]);
        let me = group.member_rank();
        let (left_before, right_before) = counts[..me]
            .iter()
            .fold((0, 0), |acc, c| (acc.0 + c[0], acc.1 + c[1]));
        let (left_total, right_total) = counts
            .iter()
            .fold((0, 0), |acc, c| (acc.0 + c[0], acc.1 + c[1]));

        let mut outgoing = vec![Vec::new(); np];
        for (j, point) in left.iter().enumerate() {
            let dest = spread(left_before + j as u64, left_total, lp);
            outgoing[dest].extend_from_slice(point);
        }
        for (j, point) in right.iter().enumerate() {
            let dest = lp + spread(right_before + j as u64, right_total, np - lp);
            outgoing[dest].extend_from_slice(point);
        }

        group
            .exchange_values(outgoing)
            .iter()
            .flat_map(|values| unflatten(values).collect::<Vec<_>>())
            .collect()
    }

    /// Gather node records on rank 0 and broadcast the assembled tree to every process.
    fn share_tree<C: Communicator>(comm: &C, records: &[NodeRecord]) -> Result<PartitionTree> {
        let world = SubGroup::whole(comm, TREE_BROADCAST_TAG)?;

        let mut local = Vec::with_capacity(records.len() * RECORD_LEN);
        for record in records {
            record.write(&mut local);
        }

        let packed = match world.gather_bytes(&local, 0) {
            Some(blocks) => {
                let records: HashMap<u64, NodeRecord> = blocks
                    .iter()
                    .flat_map(|b| b.chunks_exact(RECORD_LEN).map(NodeRecord::read).collect::<Vec<_>>())
                    .map(|r| (r.id, r))
                    .collect();
                match assemble(&records) {
                    Some(nodes) => PartitionTree::from_nodes(nodes)
                        .map(|tree| tree.pack())
                        .unwrap_or_default(),
                    None => {
                        warn!(records = records.len(), "incomplete partition tree records");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let packed = world.broadcast(&packed, 0);
        PartitionTree::unpack(&packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::prelude::*;
    use rand::SeedableRng;

    use crate::comm::local::LocalUniverse;

    fn points_fixture(npoints: usize, seed: u64) -> Vec<Coordinate> {
        let mut range = StdRng::seed_from_u64(seed);
        let between = rand::distributions::Uniform::from(0.0..1.0);
        (0..npoints)
            .map(|_| {
                [
                    between.sample(&mut range),
                    between.sample(&mut range),
                    between.sample(&mut range),
                ]
            })
            .collect()
    }

    fn volume(bounds: &Bounds) -> f64 {
        bounds.diameter().iter().product()
    }

    fn builder(number_of_regions: Option<usize>) -> PartitionTreeBuilder {
        PartitionTreeBuilder::new(BuildConfig {
            number_of_regions,
            include_ghost_cells: false,
        })
    }

    #[test]
    fn test_regions_tile_bounds() {
        let points = points_fixture(100, 0);
        let trees = LocalUniverse::run(1, |comm| builder(Some(8)).build_locator(&comm, &points, &[]).unwrap());
        let tree = &trees[0];

        assert_eq!(tree.number_of_regions(), 8);
        assert_eq!(tree.depth(), 3);

        let root = tree.bounds();
        let mut covered = 0.;
        for region in 0..8 {
            let bounds = tree.region_bounds(region).unwrap();
            assert!(root.contains(&bounds.min) && root.contains(&bounds.max));
            covered += volume(&bounds);
            for other in (region + 1)..8 {
                let overlap = tree.region_bounds(other).unwrap();
                let shared: f64 = (0..3)
                    .map(|d| (bounds.max[d].min(overlap.max[d]) - bounds.min[d].max(overlap.min[d])).max(0.))
                    .product();
                assert_eq!(shared, 0.);
            }
        }
        assert!((covered - volume(&root)).abs() < 1e-12);

        let tables = tree.tables().unwrap();
        for region in 0..8 {
            let cells = tables.total_cells_in_region(region).unwrap();
            assert!(cells == 12 || cells == 13, "region {} holds {}", region, cells);
        }
        for point in points.iter() {
            assert_eq!(tree.region_containing_point(point), Some(tree.locate(point)));
        }
    }

    #[test]
    fn test_distributed_regions_tile_bounds() {
        let nprocs = 3;
        let per_rank: Vec<Vec<Coordinate>> = (0..nprocs).map(|r| points_fixture(40, 10 + r as u64)).collect();
        let trees = LocalUniverse::run(nprocs, |comm| {
            builder(Some(6))
                .build_locator(&comm, &per_rank[comm.rank() as usize], &[])
                .unwrap()
        });
        let tree = &trees[0];
        assert!(trees.iter().all(|other| other.pack() == tree.pack()));
        assert_eq!(tree.number_of_regions(), 6);

        let root = tree.bounds();
        let mut covered = 0.;
        for region in 0..6 {
            let bounds = tree.region_bounds(region).unwrap();
            covered += volume(&bounds);
            for other in (region + 1)..6 {
                let overlap = tree.region_bounds(other).unwrap();
                let shared: f64 = (0..3)
                    .map(|d| (bounds.max[d].min(overlap.max[d]) - bounds.min[d].max(overlap.min[d])).max(0.))
                    .product();
                assert_eq!(shared, 0., "regions {} and {} overlap", region, other);
            }
        }
        assert!((covered - volume(&root)).abs() < 1e-12);

        for point in per_rank.iter().flatten() {
            assert!(root.contains(point));
            let region = tree.locate(point);
            assert!(tree.region_bounds(region).unwrap().contains(point));
        }
    }

    #[test]
    fn test_distributed_build_is_balanced_and_shared() {
        let nprocs = 4;
        let per_rank: Vec<Vec<Coordinate>> = (0..nprocs).map(|r| points_fixture(50, r as u64)).collect();
        let trees = LocalUniverse::run(nprocs, |comm| {
            builder(None)
                .build_locator(&comm, &per_rank[comm.rank() as usize], &[])
                .unwrap()
        });

        for tree in trees.iter() {
            assert_eq!(tree, &trees[0]);
        }
        let tree = &trees[0];
        assert_eq!(tree.number_of_regions(), nprocs);
        let tables = tree.tables().unwrap();
        for region in 0..nprocs {
            assert_eq!(tables.total_cells_in_region(region).unwrap(), 50);
        }
        for rank in 0..nprocs {
            assert_eq!(tables.total_cells_on_process(rank).unwrap(), 50);
            for point in per_rank[rank].iter() {
                let region = tree.locate(point);
                assert!(tables.process_list(region).unwrap().contains(&rank));
            }
        }
    }

    #[test]
    fn test_more_regions_than_processes() {
        let per_rank: Vec<Vec<Coordinate>> = (0..3).map(|r| points_fixture(40 + r, 10 + r as u64)).collect();
        let trees = LocalUniverse::run(3, |comm| {
            builder(Some(5))
                .build_locator(&comm, &per_rank[comm.rank() as usize], &[])
                .unwrap()
        });
        let tree = &trees[2];
        assert_eq!(tree, &trees[0]);
        assert_eq!(tree.number_of_regions(), 5);
        let tables = tree.tables().unwrap();
        let total: u64 = (0..5).map(|r| tables.total_cells_in_region(r).unwrap()).sum();
        assert_eq!(total, 123);
    }

    #[test]
    fn test_empty_processes() {
        let trees = LocalUniverse::run(3, |comm| {
            let points = if comm.rank() == 1 {
                Vec::new()
            } else {
                points_fixture(30, comm.rank() as u64)
            };
            builder(None).build_locator(&comm, &points, &[]).unwrap()
        });
        let tables = trees[0].tables().unwrap();
        assert_eq!(trees[0].number_of_regions(), 3);
        assert_eq!(tables.total_cells_on_process(1).unwrap(), 0);
        assert_eq!(tables.region_list(1).unwrap(), &[] as &[usize]);
        let total: u64 = (0..3).map(|r| tables.total_cells_in_region(r).unwrap()).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn test_all_empty_is_an_error() {
        let results = LocalUniverse::run(2, |comm| builder(None).build_locator(&comm, &[], &[]));
        for result in results {
            assert!(matches!(result, Err(Error::EmptyDataset)));
        }
    }

    #[test]
    fn test_identical_points_make_one_region() {
        let points = vec![[0.5, 0.5, 0.5]; 20];
        let trees = LocalUniverse::run(2, |comm| builder(Some(4)).build_locator(&comm, &points, &[]).unwrap());
        assert_eq!(trees[0].number_of_regions(), 1);
        assert_eq!(trees[0].tables().unwrap().total_cells_in_region(0).unwrap(), 40);
    }

    #[test]
    fn test_ties_go_to_one_side() {
        let mut points = vec![[0., 0., 0.]; 10];
        points.extend([[1., 0., 0.], [1., 0., 0.]]);
        let trees = LocalUniverse::run(1, |comm| builder(Some(2)).build_locator(&comm, &points, &[]).unwrap());
        let tree = &trees[0];
        let tables = tree.tables().unwrap();
        assert_eq!(tree.number_of_regions(), 2);
        assert_eq!(tables.total_cells_in_region(0).unwrap(), 10);
        assert_eq!(tables.total_cells_in_region(1).unwrap(), 2);
        assert_eq!(tree.locate(&[0., 0., 0.]), 0);
    }

    #[test]
    fn test_ghost_points_are_left_out_of_the_split() {
        let mut points = points_fixture(40, 3);
        let mut ghost = vec![false; 40];
        // Far away ghosts would stretch the root bounds if they took part.
        points.extend([[10., 10., 10.], [11., 10., 10.]]);
        ghost.extend([true, true]);

        let trees = LocalUniverse::run(1, |comm| builder(Some(2)).build_locator(&comm, &points, &ghost).unwrap());
        let tree = &trees[0];
        assert!(tree.bounds().max[0] < 1.);
        let tables = tree.tables().unwrap();
        assert_eq!(tables.total_cells_in_region(0).unwrap(), 20);
        assert_eq!(tables.total_cells_in_region(1).unwrap(), 20);
        assert_eq!(tables.process_list_with_ghosts(1).unwrap(), &[0]);
    }

    #[test]
    fn test_choose_split() {
        let selection = Selection {
            value: 0.,
            below: 3,
            equal: 4,
        };
        assert_eq!(choose_split(&selection, 4, 10), Some(false));
        assert_eq!(choose_split(&selection, 6, 10), Some(true));
        assert_eq!(choose_split(&selection, 3, 7), Some(false));
        let constant = Selection {
            value: 0.,
            below: 0,
            equal: 5,
        };
        assert_eq!(choose_split(&constant, 2, 5), None);
    }

    #[test]
    fn test_record_encoding() {
        let record = NodeRecord {
            id: 6,
            dim: Some(2),
            value: 0.25,
            equal_left: true,
            bounds: Bounds::new([0.; 3], [1., 2., 3.]),
        };
        let mut bytes = Vec::new();
        record.write(&mut bytes);
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(NodeRecord::read(&bytes), record);
    }
}
