//! Per-frame delivery of item data between process roles, and redistribution of delivered
//! data to the regions of an ordering tree.
pub mod item;
pub mod manager;
pub mod redistribute;

pub use item::{DeliveryItem, ItemFlags, ItemKey, Resolution};
pub use manager::DeliveryManager;
pub use redistribute::{BoundaryMode, RegionRedistributor, Redistributor};
