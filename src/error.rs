//! Errors reported by tree construction, data movement and delivery.
use thiserror::Error;

use crate::{comm::Rank, types::topology::Role};

#[derive(Debug, Error)]
pub enum Error {
    /// A collective was requested without a process-group communicator.
    #[error("no communicator available for the requested collective")]
    MissingCommunicator,

    /// A socket leg was requested but no channel was configured.
    #[error("no socket channel configured towards {role:?}")]
    MissingChannel { role: Role },

    #[error("invalid region assignment: {0}")]
    InvalidAssignment(String),

    /// The role cannot take part in the requested layout.
    #[error("invalid process topology: {0}")]
    InvalidTopology(String),

    #[error("region {0} does not exist")]
    InvalidRegion(usize),

    #[error("process {0} is out of range")]
    InvalidProcess(Rank),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// A query needs a partition tree that has not been built.
    #[error("partition tree has not been built")]
    NoTree,

    #[error("no process holds any points")]
    EmptyDataset,

    /// Processes disagree on the registered item set.
    #[error("delivery state out of sync: local token {local:#x}, remote token {remote:#x}")]
    OutOfSync { local: u64, remote: u64 },

    #[error("cannot merge datasets of different kinds")]
    IncompatibleDatasets,

    #[error("item {0} is not registered")]
    UnknownItem(u32),

    #[error("dataset codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A packed tree buffer does not describe a valid tree.
    #[error("malformed packed tree: {0}")]
    Decode(String),

    #[error("vtk export failed: {0}")]
    Export(String),

    /// The textual header of a marshal block could not be parsed.
    #[error("malformed block header: {0}")]
    Header(String),
}

pub type Result<T> = std::result::Result<T, Error>;
