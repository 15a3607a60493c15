//! Decides, per frame, which items have to move and how, and keeps the ordering tree used
//! for sorted compositing.
//!
//! Every process of every role holds a manager with the same registered items. Collective
//! calls inside a delivery must line up across processes, so the list of items to move is
//! decided by one driver process and handed to everybody else before anything moves.
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    comm::Communicator,
    config::DeliveryConfig,
    constants::{DELIVERY_KEYS_TAG, SYNC_TAG},
    delivery::{
        item::{DeliveryItem, ItemFlags, ItemKey, Resolution},
        redistribute::Redistributor,
    },
    error::{Error, Result},
    moving::{
        mover::DataMover,
        plan::MoveMode,
    },
    partition::{
        assignment::AssignmentPolicy,
        builder::PartitionTreeBuilder,
        tree::PartitionTree,
    },
    subgroup::SubGroup,
    types::{
        dataset::{Coordinate, Dataset},
        topology::{Layout, ProcessTopology, Role},
    },
};

pub struct DeliveryManager {
    config: DeliveryConfig,
    clock: u64,
    remote_rendering: bool,
    registered: BTreeSet<u32>,
    flags: HashMap<u32, ItemFlags>,
    items: BTreeMap<(ItemKey, Resolution), DeliveryItem>,
    tree: Option<PartitionTree>,
    tree_time: u64,
    tree_token: Option<u64>,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig) -> Self {
        DeliveryManager {
            config,
            clock: 0,
            remote_rendering: true,
            registered: BTreeSet::new(),
            flags: HashMap::new(),
            items: BTreeMap::new(),
            tree: None,
            tree_time: 0,
            tree_token: None,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Whether frames are rendered away from the client. Without remote rendering all
    /// data is collected on the client.
    pub fn set_remote_rendering(&mut self, remote: bool) {
        self.remote_rendering = remote;
    }

    pub fn register_item(&mut self, id: u32) {
        if self.registered.insert(id) {
            self.flags.insert(id, ItemFlags::default());
            debug!(id, "item registered");
        }
    }

    pub fn unregister_item(&mut self, id: u32) {
        if self.registered.remove(&id) {
            self.flags.remove(&id);
            self.items.retain(|(key, _), _| key.id != id);
            debug!(id, "item unregistered");
        }
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.registered.contains(&id)
    }

    fn check_registered(&self, id: u32) -> Result<()> {
        if self.registered.contains(&id) {
            Ok(())
        } else {
            warn!(id, "item is not registered");
            Err(Error::UnknownItem(id))
        }
    }

    pub fn flags(&self, id: u32) -> Result<ItemFlags> {
        self.flags.get(&id).copied().ok_or(Error::UnknownItem(id))
    }

    fn update_flags(&mut self, id: u32, update: impl FnOnce(&mut ItemFlags)) -> Result<()> {
        self.check_registered(id)?;
        let flags = self.flags.entry(id).or_default();
        update(flags);
        Ok(())
    }

    pub fn set_visible(&mut self, id: u32, visible: bool) -> Result<()> {
        self.update_flags(id, |f| f.visible = visible)
    }

    pub fn set_deliver_to_all_processes(&mut self, id: u32, clone: bool) -> Result<()> {
        self.update_flags(id, |f| f.clone_to_all = clone)
    }

    pub fn set_deliver_to_client(&mut self, id: u32, deliver: bool) -> Result<()> {
        self.update_flags(id, |f| f.deliver_to_client = deliver)
    }

    pub fn set_gather_before_delivering_to_client(&mut self, id: u32, gather: bool) -> Result<()> {
        self.update_flags(id, |f| f.gather_before_client_delivery = gather)
    }

    pub fn set_redistributable(&mut self, id: u32, redistributable: bool) -> Result<()> {
        self.update_flags(id, |f| f.redistributable = redistributable)
    }

    pub fn set_streamable(&mut self, id: u32, streamable: bool) -> Result<()> {
        self.update_flags(id, |f| f.streamable = streamable)
    }

    /// Record a new piece from the producer of `key`. The manager keeps only a weak
    /// reference to it.
    pub fn set_piece(&mut self, key: ItemKey, resolution: Resolution, piece: &Arc<Dataset>, size_hint: usize) -> Result<()> {
        self.check_registered(key.id)?;
        let time = self.tick();
        self.items
            .entry((key, resolution))
            .or_default()
            .set_producer(piece, size_hint, time);
        Ok(())
    }

    pub fn set_next_streamed_piece(&mut self, key: ItemKey, resolution: Resolution, piece: Arc<Dataset>) -> Result<()> {
        self.check_registered(key.id)?;
        self.items
            .entry((key, resolution))
            .or_default()
            .set_next_streamed(piece);
        Ok(())
    }

    /// The producer's current piece, if it is still alive.
    pub fn producer_piece(&self, key: ItemKey, resolution: Resolution) -> Option<Arc<Dataset>> {
        self.items.get(&(key, resolution)).and_then(DeliveryItem::producer)
    }

    /// What the renderer should draw: the redistributed piece when there is one for the
    /// current delivery, the delivered piece otherwise.
    pub fn delivered_piece(&self, key: ItemKey, resolution: Resolution) -> Option<Arc<Dataset>> {
        let item = self.items.get(&(key, resolution))?;
        if item.is_redistributed_for(self.tree_time) {
            item.redistributed().cloned()
        } else {
            item.delivered().cloned()
        }
    }

    /// Visible items whose producer changed after `since` and after their last delivery.
    /// Streamable items are left to streaming while it is enabled.
    pub fn needs_delivery(&self, since: u64, resolution: Resolution) -> Vec<ItemKey> {
        self.items
            .iter()
            .filter(|((_, r), _)| *r == resolution)
            .filter(|((key, _), item)| {
                let flags = self.flags.get(&key.id).copied().unwrap_or_default();
                flags.visible
                    && !(self.config.streaming && flags.streamable)
                    && item.is_stale()
                    && item.producer_time() > since
            })
            .map(|((key, _), _)| *key)
            .collect()
    }

    /// How an item with `flags` moves.
    pub fn move_mode_for(flags: &ItemFlags, remote_rendering: bool) -> MoveMode {
        if flags.clone_to_all {
            MoveMode::Clone
        } else if !remote_rendering {
            MoveMode::Collect
        } else if flags.deliver_to_client {
            MoveMode::CollectAndPassThrough
        } else {
            MoveMode::PassThrough
        }
    }

    /// Hash of the registered ids, equal on processes that registered the same items.
    pub fn synchronization_token(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for id in self.registered.iter() {
            id.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Compare the synchronization token across `comm`. Collective.
    pub fn check_synchronized<C: Communicator>(&self, comm: &C) -> Result<()> {
        let group = SubGroup::whole(comm, SYNC_TAG)?;
        let local = self.synchronization_token();
        let min = group.all_reduce_min(&[local])[0];
        let max = group.all_reduce_max(&[local])[0];
        if min == max {
            Ok(())
        } else {
            let remote = if local == min { max } else { min };
            warn!(local, remote, "delivery state out of sync");
            Err(Error::OutOfSync { local, remote })
        }
    }

    fn is_driver<C: Communicator>(topology: &ProcessTopology<C>) -> bool {
        match topology.layout() {
            Layout::SingleGroup => topology.is_group_root(),
            _ => topology.role() == Role::Client,
        }
    }

    /// Hand the driver's move list to every process of every role.
    fn share_move_list<C: Communicator>(
        topology: &mut ProcessTopology<C>,
        list: &[(ItemKey, MoveMode)],
    ) -> Result<Vec<(ItemKey, MoveMode)>> {
        let mut bytes = if Self::is_driver(topology) {
            serde_json::to_vec(list)?
        } else {
            Vec::new()
        };

        let root = topology.is_group_root();
        match (topology.layout(), topology.role()) {
            (Layout::SingleGroup, _) => {
                bytes = SubGroup::whole(topology.group()?, SYNC_TAG)?.broadcast_bytes(&bytes, 0);
            }
            (_, Role::Client) => topology.client_channel()?.send(DELIVERY_KEYS_TAG, &bytes)?,
            (layout, Role::DataServer) => {
                if root {
                    bytes = topology.client_channel()?.receive(DELIVERY_KEYS_TAG)?;
                }
                bytes = SubGroup::whole(topology.group()?, SYNC_TAG)?.broadcast_bytes(&bytes, 0);
                if root && layout == Layout::ClientDataRender {
                    topology.render_channel()?.send(DELIVERY_KEYS_TAG, &bytes)?;
                }
            }
            (_, Role::RenderServer) => {
                if root {
                    bytes = topology.render_channel()?.receive(DELIVERY_KEYS_TAG)?;
                }
                bytes = SubGroup::whole(topology.group()?, SYNC_TAG)?.broadcast_bytes(&bytes, 0);
            }
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Move every stale item at `resolution`, as decided by the driver. Every process of
    /// every role must call this together. Returns the moved keys.
    pub fn deliver<C: Communicator>(&mut self, topology: &mut ProcessTopology<C>, resolution: Resolution) -> Result<Vec<ItemKey>> {
        let list: Vec<(ItemKey, MoveMode)> = if Self::is_driver(topology) {
            self.needs_delivery(0, resolution)
                .into_iter()
                .map(|key| {
                    let flags = self.flags.get(&key.id).copied().unwrap_or_default();
                    (key, Self::move_mode_for(&flags, self.remote_rendering))
                })
                .collect()
        } else {
            Vec::new()
        };
        let list = Self::share_move_list(topology, &list)?;
        if !list.is_empty() {
            info!(items = list.len(), ?resolution, role = ?topology.role(), "delivering");
        }

        for &(key, mode) in list.iter() {
            let flags = self.flags.get(&key.id).copied().unwrap_or_default();
            let input = self
                .producer_piece(key, resolution)
                .unwrap_or_else(|| Arc::new(Dataset::default()));
            let mover = DataMover::new(self.config.mover_config(flags.gather_before_client_delivery));
            let moved = mover.execute(topology, mode, &input)?;

            let time = self.tick();
            if self.registered.contains(&key.id) {
                self.items
                    .entry((key, resolution))
                    .or_default()
                    .set_delivered(Arc::new(moved.output), time);
            } else {
                warn!(id = key.id, "delivered an item that is not registered here");
            }
        }
        Ok(list.into_iter().map(|(key, _)| key).collect())
    }

    /// Move the next streamed piece of each of `keys` and append it to what was delivered
    /// so far. `keys` must be the same on every process.
    pub fn deliver_streamed_pieces<C: Communicator>(
        &mut self,
        topology: &mut ProcessTopology<C>,
        resolution: Resolution,
        keys: &[ItemKey],
    ) -> Result<()> {
        for &key in keys {
            let flags = self.flags.get(&key.id).copied().unwrap_or_default();
            let mode = Self::move_mode_for(&flags, self.remote_rendering);
            let piece = self
                .items
                .get_mut(&(key, resolution))
                .and_then(DeliveryItem::take_next_streamed)
                .unwrap_or_else(|| Arc::new(Dataset::default()));

            let mover = DataMover::new(self.config.mover_config(flags.gather_before_client_delivery));
            let moved = mover.execute(topology, mode, &piece)?;

            let time = self.tick();
            let item = self.items.entry((key, resolution)).or_default();
            let combined = match item.delivered() {
                Some(previous) => Dataset::merge(vec![(**previous).clone(), moved.output])?
                    .unwrap_or_default(),
                None => moved.output,
            };
            item.set_delivered(Arc::new(combined), time);
        }
        Ok(())
    }

    /// Items taking part in the ordering tree, in key order: the union over `group` of
    /// the visible, delivered, redistributable items of each process. Collective.
    ///
    /// Visibility is a per-process setting, so the local lists may differ; every process
    /// has to walk the same list because each item costs one collective exchange.
    fn redistributable_keys<C: Communicator>(&self, group: &SubGroup<C>, resolution: Resolution) -> Vec<ItemKey> {
        let local: Vec<i64> = self
            .items
            .iter()
            .filter(|((key, r), item)| {
                let flags = self.flags.get(&key.id).copied().unwrap_or_default();
                *r == resolution && flags.redistributable && flags.visible && item.delivered().is_some()
            })
            .map(|((key, _), _)| (i64::from(key.id) << 32) | i64::from(key.port))
            .collect();

        group
            .all_reduce_unique_list(&local)
            .into_iter()
            .map(|packed| ItemKey::new((packed >> 32) as u32, packed as u32))
            .collect()
    }

    fn ordering_token(&self, keys: &[ItemKey], resolution: Resolution) -> u64 {
        let mut hasher = DefaultHasher::new();
        for key in keys {
            key.hash(&mut hasher);
            self.items
                .get(&(*key, resolution))
                .map_or(0, DeliveryItem::delivered_time)
                .hash(&mut hasher);
        }
        self.tree_time.hash(&mut hasher);
        hasher.finish()
    }

    /// Rebuild the ordering tree from the delivered pieces of redistributable items,
    /// unless nothing that went into the current tree changed. Collective over `comm`.
    /// Returns whether a new tree was built.
    pub fn update_ordering_tree<C: Communicator>(&mut self, comm: &C, resolution: Resolution) -> Result<bool> {
        let group = SubGroup::whole(comm, SYNC_TAG)?;
        let keys = self.redistributable_keys(&group, resolution);
        let token = self.ordering_token(&keys, resolution);
        let stale = self.tree.is_none() || self.tree_token != Some(token);

        if group.all_reduce_max(&[u64::from(stale)])[0] == 0 {
            return Ok(false);
        }

        let mut centers: Vec<Coordinate> = Vec::new();
        let mut ghost: Vec<bool> = Vec::new();
        for key in keys.iter() {
            if let Some(piece) = self.items.get(&(*key, resolution)).and_then(DeliveryItem::delivered) {
                let cells = piece.cell_centers();
                match piece.cell_ghost_flags() {
                    Some(flags) => ghost.extend_from_slice(flags),
                    None => ghost.extend(std::iter::repeat(false).take(cells.len())),
                }
                centers.extend(cells);
            }
        }

        let builder = PartitionTreeBuilder::new(self.config.build.clone());
        let mut tree = match builder.build_locator(comm, &centers, &ghost) {
            Ok(tree) => tree,
            Err(Error::EmptyDataset) => {
                debug!("no data for the ordering tree");
                self.tree = None;
                self.tree_token = None;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        tree.assign_regions(&AssignmentPolicy::from(self.config.assignment), comm.size() as usize)?;

        self.tree = Some(tree);
        self.tree_time = self.tick();
        self.tree_token = Some(self.ordering_token(&keys, resolution));
        debug!(items = keys.len(), cells = centers.len(), "ordering tree rebuilt");
        Ok(true)
    }

    /// Reshape the delivered piece of every redistributable item to the ordering tree.
    /// Collective over `comm`. Returns the number of items redistributed.
    pub fn redistribute<C: Communicator, R: Redistributor>(
        &mut self,
        comm: &C,
        redistributor: &R,
        resolution: Resolution,
    ) -> Result<usize> {
        let tree = self.tree.as_ref().ok_or(Error::NoTree)?;
        let group = SubGroup::whole(comm, SYNC_TAG)?;
        let keys = self.redistributable_keys(&group, resolution);

        // Skipping must be decided together, the exchange inside is collective.
        let stale: Vec<u64> = keys
            .iter()
            .map(|key| {
                let current = self
                    .items
                    .get(&(*key, resolution))
                    .map_or(false, |item| item.is_redistributed_for(self.tree_time));
                u64::from(!current)
            })
            .collect();
        let stale = group.all_reduce_max(&stale);

        let mut count = 0;
        for (key, _) in keys.iter().zip(stale).filter(|(_, s)| *s != 0) {
            // Processes without the item still take part in its exchange.
            let item = self.items.get_mut(&(*key, resolution));
            let delivered = item
                .as_ref()
                .and_then(|item| item.delivered().cloned())
                .unwrap_or_default();
            let piece = redistributor.redistribute(comm, tree, &delivered)?;
            if let Some(item) = item {
                item.set_redistributed(Arc::new(piece), self.tree_time);
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn partition_tree(&self) -> Option<&PartitionTree> {
        self.tree.as_ref()
    }

    pub fn view_order_from_position(&self, eye: &Coordinate) -> Result<Vec<usize>> {
        self.tree.as_ref().ok_or(Error::NoTree)?.view_order_from_position(eye)
    }

    pub fn view_order_in_direction(&self, direction: &Coordinate) -> Result<Vec<usize>> {
        self.tree.as_ref().ok_or(Error::NoTree)?.view_order_in_direction(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::{
        comm::{
            channel::{Channel, LocalChannel},
            local::{LocalCommunicator, LocalUniverse},
        },
        delivery::redistribute::RegionRedistributor,
        types::dataset::tests::cloud_fixture,
    };

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn streaming_config() -> DeliveryConfig {
        DeliveryConfig {
            streaming: true,
            ..DeliveryConfig::default()
        }
    }

    fn points(manager: &DeliveryManager, key: ItemKey) -> usize {
        manager
            .delivered_piece(key, Resolution::Full)
            .map_or(0, |piece| piece.number_of_points())
    }

    #[test]
    fn test_flags_require_registration() {
        let mut manager = DeliveryManager::new(DeliveryConfig::default());
        let piece = Arc::new(cloud_fixture(3, 0));

        assert!(matches!(manager.set_visible(7, false), Err(Error::UnknownItem(7))));
        assert!(matches!(
            manager.set_piece(ItemKey::new(7, 0), Resolution::Full, &piece, 0),
            Err(Error::UnknownItem(7))
        ));

        manager.register_item(7);
        manager.set_deliver_to_client(7, true).unwrap();
        assert!(manager.flags(7).unwrap().deliver_to_client);
        assert!(manager.flags(7).unwrap().visible);
    }

    #[test]
    fn test_needs_delivery() {
        let mut manager = DeliveryManager::new(streaming_config());
        let pieces: Vec<_> = (0..3).map(|i| Arc::new(cloud_fixture(4, i))).collect();
        for id in 0..3 {
            manager.register_item(id);
            manager
                .set_piece(ItemKey::new(id, 0), Resolution::Full, &pieces[id as usize], 0)
                .unwrap();
        }
        manager.set_visible(1, false).unwrap();
        manager.set_streamable(2, true).unwrap();

        assert_eq!(manager.needs_delivery(0, Resolution::Full), vec![ItemKey::new(0, 0)]);
        assert!(manager.needs_delivery(0, Resolution::Low).is_empty());
        // Nothing changed after the last piece was set.
        assert!(manager.needs_delivery(3, Resolution::Full).is_empty());
    }

    #[test]
    fn test_unregister_drops_state() {
        let mut manager = DeliveryManager::new(DeliveryConfig::default());
        let piece = Arc::new(cloud_fixture(4, 0));
        manager.register_item(1);
        manager.set_piece(ItemKey::new(1, 0), Resolution::Full, &piece, 0).unwrap();

        manager.unregister_item(1);
        assert!(!manager.is_registered(1));
        assert!(manager.producer_piece(ItemKey::new(1, 0), Resolution::Full).is_none());
        assert!(manager.needs_delivery(0, Resolution::Full).is_empty());
    }

    #[test]
    fn test_move_mode_for() {
        let mut flags = ItemFlags::default();
        assert_eq!(DeliveryManager::move_mode_for(&flags, true), MoveMode::PassThrough);
        assert_eq!(DeliveryManager::move_mode_for(&flags, false), MoveMode::Collect);

        flags.deliver_to_client = true;
        assert_eq!(DeliveryManager::move_mode_for(&flags, true), MoveMode::CollectAndPassThrough);

        flags.clone_to_all = true;
        assert_eq!(DeliveryManager::move_mode_for(&flags, true), MoveMode::Clone);
        assert_eq!(DeliveryManager::move_mode_for(&flags, false), MoveMode::Clone);
    }

    #[test]
    fn test_synchronization() {
        let results = LocalUniverse::run(3, |comm| {
            let mut manager = DeliveryManager::new(DeliveryConfig::default());
            manager.register_item(1);
            let agreed = manager.check_synchronized(&comm).is_ok();
            if comm.rank() == 2 {
                manager.register_item(2);
            }
            (agreed, manager.check_synchronized(&comm))
        });

        for (agreed, result) in results {
            assert!(agreed);
            assert!(matches!(result, Err(Error::OutOfSync { .. })));
        }
    }

    #[test]
    fn test_single_group_delivery() {
        init_logging();
        let cloned = ItemKey::new(1, 0);
        let kept = ItemKey::new(2, 0);

        let results = LocalUniverse::run(3, |comm| {
            let rank = comm.rank() as usize;
            let mut topology = ProcessTopology::single_group(comm);
            let mut manager = DeliveryManager::new(DeliveryConfig::default());
            manager.register_item(1);
            manager.register_item(2);
            manager.set_deliver_to_all_processes(1, true).unwrap();

            let first = Arc::new(cloud_fixture(5 + rank, rank as u64));
            let second = Arc::new(cloud_fixture(2 + rank, rank as u64));
            manager.set_piece(cloned, Resolution::Full, &first, 0).unwrap();
            // Only the root's view of what is stale matters, rank 1 moves an empty piece.
            if rank != 1 {
                manager.set_piece(kept, Resolution::Full, &second, 0).unwrap();
            }

            let moved = manager.deliver(&mut topology, Resolution::Full).unwrap();
            let again = manager.deliver(&mut topology, Resolution::Full).unwrap();
            (moved, again, points(&manager, cloned), points(&manager, kept))
        });

        for (rank, (moved, again, cloned_points, kept_points)) in results.into_iter().enumerate() {
            assert_eq!(moved, vec![cloned, kept]);
            assert!(again.is_empty());
            assert_eq!(cloned_points, 5 + 6 + 7);
            assert_eq!(kept_points, if rank == 1 { 0 } else { 2 + rank });
        }
    }

    #[test]
    fn test_client_data_server_delivery() {
        init_logging();
        let key = ItemKey::new(4, 1);
        let (client_end, server_end) = LocalChannel::pair();
        let communicators = LocalUniverse::communicators(2);

        let setup = |manager: &mut DeliveryManager| {
            manager.register_item(4);
            manager.set_deliver_to_client(4, true).unwrap();
        };

        let (client_points, server_points) = thread::scope(|scope| {
            let client = scope.spawn(move || {
                let mut topology: ProcessTopology<LocalCommunicator> =
                    ProcessTopology::client(Layout::ClientDataServer, 2, 2, Box::new(client_end));
                let mut manager = DeliveryManager::new(DeliveryConfig::default());
                setup(&mut manager);
                let placeholder = Arc::new(Dataset::default());
                manager.set_piece(key, Resolution::Full, &placeholder, 0).unwrap();
                assert_eq!(manager.deliver(&mut topology, Resolution::Full).unwrap(), vec![key]);
                points(&manager, key)
            });

            let mut server_end = Some(server_end);
            let servers: Vec<_> = communicators
                .into_iter()
                .enumerate()
                .map(|(i, comm)| {
                    let channel = server_end.take().map(|c| Box::new(c) as Box<dyn Channel>);
                    scope.spawn(move || {
                        let mut topology =
                            ProcessTopology::data_server(Layout::ClientDataServer, comm, 2, channel, None);
                        let mut manager = DeliveryManager::new(DeliveryConfig::default());
                        setup(&mut manager);
                        let piece = Arc::new(cloud_fixture(10 + i, i as u64));
                        manager.set_piece(key, Resolution::Full, &piece, 0).unwrap();
                        assert_eq!(manager.deliver(&mut topology, Resolution::Full).unwrap(), vec![key]);
                        points(&manager, key)
                    })
                })
                .collect();

            (
                client.join().unwrap(),
                servers.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>(),
            )
        });

        assert_eq!(client_points, 10 + 11);
        assert_eq!(server_points, vec![10, 11]);
    }

    #[test]
    fn test_client_data_render_delivery() {
        init_logging();
        let key = ItemKey::new(5, 0);
        let (client_end, server_end) = LocalChannel::pair();
        let mut data_ends = Vec::new();
        let mut render_ends = Vec::new();
        for _ in 0..2 {
            let (a, b) = LocalChannel::pair();
            data_ends.push(Some(a));
            render_ends.push(Some(b));
        }

        let setup = |manager: &mut DeliveryManager| manager.register_item(5);

        let (client, data, render) = thread::scope(|scope| {
            let client = scope.spawn(move || {
                let mut topology: ProcessTopology<LocalCommunicator> =
                    ProcessTopology::client(Layout::ClientDataRender, 2, 2, Box::new(client_end));
                let mut manager = DeliveryManager::new(DeliveryConfig::default());
                setup(&mut manager);
                let placeholder = Arc::new(Dataset::default());
                manager.set_piece(key, Resolution::Full, &placeholder, 0).unwrap();
                let moved = manager.deliver(&mut topology, Resolution::Full).unwrap();
                (moved, points(&manager, key))
            });

            let mut server_end = Some(server_end);
            let data: Vec<_> = LocalUniverse::communicators(2)
                .into_iter()
                .zip(data_ends)
                .enumerate()
                .map(|(i, (comm, render_end))| {
                    let client_channel = server_end.take().map(|c| Box::new(c) as Box<dyn Channel>);
                    let render_channel = render_end.map(|c| Box::new(c) as Box<dyn Channel>);
                    scope.spawn(move || {
                        let mut topology = ProcessTopology::data_server(
                            Layout::ClientDataRender,
                            comm,
                            2,
                            client_channel,
                            render_channel,
                        );
                        let mut manager = DeliveryManager::new(DeliveryConfig::default());
                        setup(&mut manager);
                        let piece = Arc::new(cloud_fixture(10 + i, i as u64));
                        manager.set_piece(key, Resolution::Full, &piece, 0).unwrap();
                        let moved = manager.deliver(&mut topology, Resolution::Full).unwrap();
                        (moved, points(&manager, key))
                    })
                })
                .collect();

            let render: Vec<_> = LocalUniverse::communicators(2)
                .into_iter()
                .zip(render_ends)
                .map(|(comm, data_end)| {
                    let channel = data_end.map(|c| Box::new(c) as Box<dyn Channel>);
                    scope.spawn(move || {
                        let mut topology = ProcessTopology::render_server(comm, 2, channel);
                        let mut manager = DeliveryManager::new(DeliveryConfig::default());
                        setup(&mut manager);
                        let moved = manager.deliver(&mut topology, Resolution::Full).unwrap();
                        (moved, points(&manager, key))
                    })
                })
                .collect();

            (
                client.join().unwrap(),
                data.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>(),
                render.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>(),
            )
        });

        assert_eq!(client, (vec![key], 0));
        for (moved, delivered) in data {
            assert_eq!(moved, vec![key]);
            assert_eq!(delivered, 0);
        }
        assert_eq!(render, vec![(vec![key], 10), (vec![key], 11)]);
    }

    #[test]
    fn test_streamed_pieces_append() {
        let key = ItemKey::new(3, 0);
        let results = LocalUniverse::run(2, |comm| {
            let mut topology = ProcessTopology::single_group(comm);
            let mut manager = DeliveryManager::new(streaming_config());
            manager.register_item(3);
            manager.set_streamable(3, true).unwrap();

            let mut delivered = Vec::new();
            for n in [5, 3] {
                manager
                    .set_next_streamed_piece(key, Resolution::Full, Arc::new(cloud_fixture(n, n as u64)))
                    .unwrap();
                manager
                    .deliver_streamed_pieces(&mut topology, Resolution::Full, &[key])
                    .unwrap();
                delivered.push(points(&manager, key));
            }
            delivered
        });

        for delivered in results {
            assert_eq!(delivered, vec![5, 8]);
        }
    }

    #[test]
    fn test_ordering_tree_and_redistribution() {
        init_logging();
        let key = ItemKey::new(9, 0);
        let results = LocalUniverse::run(2, |comm| {
            let rank = comm.rank() as usize;
            let mut topology = ProcessTopology::single_group(comm.clone());
            let mut manager = DeliveryManager::new(DeliveryConfig::default());
            manager.register_item(9);
            manager.set_redistributable(9, true).unwrap();

            let piece = Arc::new(cloud_fixture(20, rank as u64));
            manager.set_piece(key, Resolution::Full, &piece, 0).unwrap();
            manager.deliver(&mut topology, Resolution::Full).unwrap();

            assert!(manager.update_ordering_tree(&comm, Resolution::Full).unwrap());
            assert!(!manager.update_ordering_tree(&comm, Resolution::Full).unwrap());

            let redistributor = RegionRedistributor::default();
            assert_eq!(manager.redistribute(&comm, &redistributor, Resolution::Full).unwrap(), 1);
            assert_eq!(manager.redistribute(&comm, &redistributor, Resolution::Full).unwrap(), 0);

            let tree = manager.partition_tree().unwrap();
            assert_eq!(tree.number_of_regions(), 2);
            let mine = match manager.delivered_piece(key, Resolution::Full).as_deref() {
                Some(Dataset::PointCloud(cloud)) => cloud.points.clone(),
                _ => panic!("expected a point cloud"),
            };
            for point in mine.iter() {
                assert_eq!(tree.process_assigned_to_region(tree.locate(point)).unwrap(), rank);
            }
            let mut order = manager.view_order_from_position(&[0.5, 0.5, -10.]).unwrap();
            order.sort_unstable();
            assert_eq!(order, vec![0, 1]);

            // A new delivery invalidates both the tree and the redistributed piece.
            let update = Arc::new(cloud_fixture(8, 100 + rank as u64));
            manager.set_piece(key, Resolution::Full, &update, 0).unwrap();
            manager.deliver(&mut topology, Resolution::Full).unwrap();
            assert_eq!(points(&manager, key), 8);
            let rebuilt = manager.update_ordering_tree(&comm, Resolution::Full).unwrap();

            (mine.len(), rebuilt)
        });

        assert_eq!(results.iter().map(|(n, _)| n).sum::<usize>(), 40);
        assert!(results.iter().all(|(_, rebuilt)| *rebuilt));
    }

    #[test]
    fn test_redistribution_with_per_process_visibility() {
        init_logging();
        let shown = ItemKey::new(1, 0);
        let hidden = ItemKey::new(2, 0);
        let results = LocalUniverse::run(2, |comm| {
            let rank = comm.rank() as usize;
            let mut topology = ProcessTopology::single_group(comm.clone());
            let mut manager = DeliveryManager::new(DeliveryConfig::default());
            let pieces = [
                Arc::new(cloud_fixture(12, rank as u64)),
                Arc::new(cloud_fixture(7, 50 + rank as u64)),
            ];
            for (key, piece) in [shown, hidden].into_iter().zip(pieces.iter()) {
                manager.register_item(key.id);
                manager.set_redistributable(key.id, true).unwrap();
                manager.set_piece(key, Resolution::Full, piece, 0).unwrap();
            }
            manager.deliver(&mut topology, Resolution::Full).unwrap();

            if rank == 1 {
                manager.set_visible(hidden.id, false).unwrap();
            }
            assert!(manager.update_ordering_tree(&comm, Resolution::Full).unwrap());
            let redistributor = RegionRedistributor::default();
            let count = manager.redistribute(&comm, &redistributor, Resolution::Full).unwrap();

            let tree = manager.partition_tree().unwrap().pack();
            (count, tree, points(&manager, shown), points(&manager, hidden))
        });

        assert_eq!(results[0].1, results[1].1);
        for (count, _, _, _) in results.iter() {
            assert_eq!(*count, 2);
        }
        assert_eq!(results.iter().map(|r| r.2).sum::<usize>(), 24);
        assert_eq!(results.iter().map(|r| r.3).sum::<usize>(), 14);
    }

    #[test]
    fn test_ordering_tree_without_data() {
        let results = LocalUniverse::run(2, |comm| {
            let mut manager = DeliveryManager::new(DeliveryConfig::default());
            let built = manager.update_ordering_tree(&comm, Resolution::Full).unwrap();
            let order = manager.view_order_in_direction(&[0., 0., 1.]);
            (built, manager.partition_tree().is_none(), order)
        });

        for (built, missing, order) in results {
            assert!(!built);
            assert!(missing);
            assert!(matches!(order, Err(Error::NoTree)));
        }
    }
}
