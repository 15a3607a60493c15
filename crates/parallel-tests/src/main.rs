use std::sync::Arc;

use mpi::traits::{Communicator as _, CommunicatorCollectives, Root};

use rand::prelude::*;
use rand::SeedableRng;

use rusty_kdtree::{
    comm::{mpi::MpiCommunicator, Communicator},
    config::{BuildConfig, DeliveryConfig},
    delivery::{DeliveryManager, ItemKey, RegionRedistributor, Resolution},
    partition::{builder::PartitionTreeBuilder, tree::PartitionTree, AssignmentPolicy},
    types::{
        dataset::{Coordinate, Dataset, PointCloud},
        topology::ProcessTopology,
    },
};

const NPOINTS: usize = 10000;

fn points_fixture(seed: u64) -> Vec<Coordinate> {
    let mut range = StdRng::seed_from_u64(seed);
    let between = rand::distributions::Uniform::from(0.0..1.0);
    let mut points = Vec::new();

    for _ in 0..NPOINTS {
        points.push([
            between.sample(&mut range),
            between.sample(&mut range),
            between.sample(&mut range),
        ])
    }
    points
}

fn tree_fixture(comm: &MpiCommunicator, points: &[Coordinate]) -> PartitionTree {
    let builder = PartitionTreeBuilder::new(BuildConfig {
        number_of_regions: Some(2 * comm.size() as usize),
        ..BuildConfig::default()
    });
    let mut tree = builder.build_locator(comm, points, &[]).unwrap();
    tree.assign_regions(&AssignmentPolicy::Contiguous, comm.size() as usize)
        .unwrap();
    tree
}

/// Test that every rank received the same tree.
fn test_identical_trees(comm: &MpiCommunicator, tree: &PartitionTree) {
    let packed = tree.pack();
    let mut root_packed = if comm.rank() == 0 {
        packed.clone()
    } else {
        vec![0.; packed.len()]
    };
    comm.raw()
        .process_at_rank(0)
        .broadcast_into(&mut root_packed[..]);
    assert_eq!(packed, root_packed);
}

/// Test that every point lies in exactly one region and regions are balanced up to the
/// rounding of each level's split.
fn test_balance(comm: &MpiCommunicator, tree: &PartitionTree, points: &[Coordinate]) {
    let mut counts = vec![0u64; tree.number_of_regions()];
    for point in points {
        counts[tree.locate(point)] += 1;
    }
    let mut totals = vec![0u64; counts.len()];
    comm.raw()
        .all_reduce_into(&counts[..], &mut totals[..], mpi::collective::SystemOperation::sum());

    let all = totals.iter().sum::<u64>();
    assert_eq!(all, NPOINTS as u64 * comm.size() as u64);
    let max = *totals.iter().max().unwrap();
    let min = *totals.iter().min().unwrap();
    assert!(max - min <= tree.depth() as u64);
}

/// Test that delivery plus redistribution conserves points and leaves each on its owner.
fn test_redistribution(comm: &MpiCommunicator, points: Vec<Coordinate>) {
    let key = ItemKey::new(0, 0);
    let mut topology = ProcessTopology::single_group(MpiCommunicator::new(comm.raw().duplicate()));
    let mut manager = DeliveryManager::new(DeliveryConfig::default());
    manager.register_item(0);
    manager.set_redistributable(0, true).unwrap();
    manager.check_synchronized(comm).unwrap();

    let piece = Arc::new(Dataset::PointCloud(PointCloud {
        points,
        scalars: Vec::new(),
        ghost: Vec::new(),
    }));
    manager.set_piece(key, Resolution::Full, &piece, 0).unwrap();
    manager.deliver(&mut topology, Resolution::Full).unwrap();
    assert!(manager.update_ordering_tree(comm, Resolution::Full).unwrap());
    manager
        .redistribute(comm, &RegionRedistributor::default(), Resolution::Full)
        .unwrap();

    let tree = manager.partition_tree().unwrap();
    let mine = manager.delivered_piece(key, Resolution::Full).unwrap();
    if let Dataset::PointCloud(cloud) = mine.as_ref() {
        for point in cloud.points.iter() {
            assert_eq!(
                tree.process_assigned_to_region(tree.locate(point)).unwrap(),
                comm.rank() as usize
            );
        }
    }

    let local = mine.number_of_points() as u64;
    let mut total = 0u64;
    comm.raw()
        .all_reduce_into(&local, &mut total, mpi::collective::SystemOperation::sum());
    assert_eq!(total, NPOINTS as u64 * comm.size() as u64);
}

fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = MpiCommunicator::new(universe.world());
    let points = points_fixture(comm.rank() as u64);

    let tree = tree_fixture(&comm, &points);
    test_identical_trees(&comm, &tree);
    test_balance(&comm, &tree, &points);
    test_redistribution(&comm, points);

    if comm.rank() == 0 {
        println!("parallel tests passed on {} ranks", comm.size());
    }
}
