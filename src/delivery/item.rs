//! Per-item delivery state.
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::types::dataset::Dataset;

/// An output port of a registered item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub id: u32,
    pub port: u32,
}

impl ItemKey {
    pub fn new(id: u32, port: u32) -> Self {
        ItemKey { id, port }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Full,
    Low,
}

/// Delivery options of an item, shared by all its ports and resolutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFlags {
    pub visible: bool,
    pub clone_to_all: bool,
    pub deliver_to_client: bool,
    pub gather_before_client_delivery: bool,
    pub redistributable: bool,
    pub streamable: bool,
}

impl Default for ItemFlags {
    fn default() -> Self {
        ItemFlags {
            visible: true,
            clone_to_all: false,
            deliver_to_client: false,
            gather_before_client_delivery: true,
            redistributable: false,
            streamable: false,
        }
    }
}

/// One port at one resolution.
///
/// The producer's piece is only borrowed: it stays owned by whoever produced it and may
/// disappear at any time. Delivered and redistributed pieces belong to the item and are
/// replaced wholesale.
#[derive(Debug, Default)]
pub struct DeliveryItem {
    producer: Weak<Dataset>,
    producer_time: u64,
    size_hint: usize,
    delivered: Option<Arc<Dataset>>,
    delivered_time: u64,
    redistributed: Option<Arc<Dataset>>,
    /// Delivered and tree timestamps the redistributed piece was made from.
    redistributed_from: (u64, u64),
    next_streamed: Option<Arc<Dataset>>,
}

impl DeliveryItem {
    pub fn set_producer(&mut self, piece: &Arc<Dataset>, size_hint: usize, time: u64) {
        self.producer = Arc::downgrade(piece);
        self.size_hint = size_hint;
        self.producer_time = time;
    }

    /// The producer's piece, if it is still alive.
    pub fn producer(&self) -> Option<Arc<Dataset>> {
        self.producer.upgrade()
    }

    pub fn producer_time(&self) -> u64 {
        self.producer_time
    }

    pub fn size_hint(&self) -> usize {
        self.size_hint
    }

    /// The producer changed after the last delivery.
    pub fn is_stale(&self) -> bool {
        self.producer_time > self.delivered_time
    }

    pub fn set_delivered(&mut self, piece: Arc<Dataset>, time: u64) {
        self.delivered = Some(piece);
        self.delivered_time = time;
        self.redistributed = None;
    }

    pub fn delivered(&self) -> Option<&Arc<Dataset>> {
        self.delivered.as_ref()
    }

    pub fn delivered_time(&self) -> u64 {
        self.delivered_time
    }

    pub fn set_redistributed(&mut self, piece: Arc<Dataset>, tree_time: u64) {
        self.redistributed = Some(piece);
        self.redistributed_from = (self.delivered_time, tree_time);
    }

    pub fn redistributed(&self) -> Option<&Arc<Dataset>> {
        self.redistributed.as_ref()
    }

    /// The redistributed piece matches the current delivery and tree.
    pub fn is_redistributed_for(&self, tree_time: u64) -> bool {
        self.redistributed.is_some() && self.redistributed_from == (self.delivered_time, tree_time)
    }

    pub fn set_next_streamed(&mut self, piece: Arc<Dataset>) {
        self.next_streamed = Some(piece);
    }

    pub fn take_next_streamed(&mut self) -> Option<Arc<Dataset>> {
        self.next_streamed.take()
    }
}
