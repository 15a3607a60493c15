use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rusty_kdtree::{
    comm::{local::LocalUniverse, Communicator},
    config::DeliveryConfig,
    data::{JSON, VTK},
    delivery::{DeliveryManager, ItemKey, RegionRedistributor, Resolution},
    types::{
        dataset::{Dataset, PointCloud},
        topology::ProcessTopology,
    },
    Result,
};

use rand::prelude::*;
use rand::SeedableRng;

const NPROCS: usize = 4;
const NPOINTS: usize = 10000;

/// One process of an in-process session: deliver a random cloud, build the ordering
/// tree and redistribute the cloud to it.
fn session(comm: rusty_kdtree::comm::local::LocalCommunicator, config: &DeliveryConfig) -> Result<()> {
    let rank = comm.rank();
    let key = ItemKey::new(0, 0);

    let mut range = StdRng::seed_from_u64(rank as u64);
    let between = rand::distributions::Uniform::from(0.0..1.0);
    let points = (0..NPOINTS)
        .map(|_| {
            [
                between.sample(&mut range),
                between.sample(&mut range),
                between.sample(&mut range),
            ]
        })
        .collect();
    let piece = Arc::new(Dataset::PointCloud(PointCloud {
        points,
        scalars: Vec::new(),
        ghost: Vec::new(),
    }));

    let mut topology = ProcessTopology::single_group(comm.clone());
    let mut manager = DeliveryManager::new(config.clone());
    manager.register_item(0);
    manager.set_redistributable(0, true)?;
    manager.check_synchronized(&comm)?;

    manager.set_piece(key, Resolution::Full, &piece, NPOINTS)?;
    manager.deliver(&mut topology, Resolution::Full)?;
    manager.update_ordering_tree(&comm, Resolution::Full)?;
    manager.redistribute(&comm, &RegionRedistributor::new(config.boundary_mode), Resolution::Full)?;

    let mine = manager
        .delivered_piece(key, Resolution::Full)
        .map_or(0, |piece| piece.number_of_points());
    info!(rank, points = mine, "redistributed");

    if rank == 0 {
        if let Some(tree) = manager.partition_tree() {
            let order = manager.view_order_from_position(&[0.5, 0.5, -1.])?;
            info!(regions = tree.number_of_regions(), ?order, "ordering tree");
            tree.write_json("regions.json")?;
            tree.write_vtk("regions.vtk")?;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1).map(DeliveryConfig::from_json_file) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            eprintln!("cannot read configuration: {}", e);
            std::process::exit(1);
        }
        None => DeliveryConfig::default(),
    };

    let results = LocalUniverse::run(NPROCS, |comm| session(comm, &config));
    for (rank, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            eprintln!("rank {}: {}", rank, e);
        }
    }
}
