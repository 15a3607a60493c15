//! Crate wide constants
use crate::comm::Tag;

/// Tag namespace reserved for the partition-tree builder.
pub const BUILD_TAG: Tag = 0x4b44;

/// Tag used by the builder's final tree broadcast.
pub const TREE_BROADCAST_TAG: Tag = 0x4b45;

/// Tag used when contributing region/process bookkeeping tables.
pub const TABLES_TAG: Tag = 0x4b46;

/// Tag for collectives issued by the data mover inside a role's process group.
pub const MOVE_GROUP_TAG: Tag = 0x4d56;

/// Tag for the data mover's AllToN relay inside the data-server group.
pub const ALL_TO_N_TAG: Tag = 0x4d57;

/// Tag for redistribution exchanges.
pub const REDISTRIBUTE_TAG: Tag = 0x5244;

/// Tag for the delivery manager's synchronisation collectives.
pub const SYNC_TAG: Tag = 0x5359;

/// Socket message tags.
pub const CLIENT_DATA_TAG: u32 = 23480;
pub const RENDER_DATA_TAG: u32 = 23481;
pub const DELIVERY_KEYS_TAG: u32 = 23482;

/// Magic prefix of a compressed marshal block.
pub const ZLIB_MAGIC: &[u8; 4] = b"zlib";

/// Length of the compressed block header, magic plus little-endian u32 length.
pub const ZLIB_HEADER_LEN: usize = 8;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
