//! Balanced spatial partition of distributed points into regions owned by processes.
pub mod assignment;
pub mod builder;
pub mod select;
pub mod tables;
pub mod tree;

pub use assignment::{Assignment, AssignmentKind, AssignmentPolicy};
pub use builder::PartitionTreeBuilder;
pub use tree::{PartitionTree, SpatialRegion};
