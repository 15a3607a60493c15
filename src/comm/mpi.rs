//! MPI backend, enabled with the `mpi` feature.
//!
//! The caller initialises MPI and hands over a communicator:
//!
//! ```ignore
//! let universe = mpi::initialize().unwrap();
//! let world = MpiCommunicator::new(universe.world());
//! ```
use mpi::{
    topology::{Color, SimpleCommunicator},
    traits::{Communicator as _, Destination, Source},
};

use crate::{
    comm::{Communicator, Rank, Tag},
    types::topology::Role,
};

pub struct MpiCommunicator {
    comm: SimpleCommunicator,
}

impl MpiCommunicator {
    pub fn new(comm: SimpleCommunicator) -> Self {
        MpiCommunicator { comm }
    }

    /// Split a job that hosts several roles into one communicator per role.
    pub fn split_by_role(&self, role: Role) -> Option<MpiCommunicator> {
        let color = match role {
            Role::Client => 0,
            Role::DataServer => 1,
            Role::RenderServer => 2,
        };
        self.comm
            .split_by_color(Color::with_value(color))
            .map(MpiCommunicator::new)
    }

    pub fn raw(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    fn size(&self) -> Rank {
        self.comm.size()
    }

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) {
        self.comm.process_at_rank(dest).send_with_tag(data, tag);
    }

    fn receive(&self, source: Rank, tag: Tag) -> Vec<u8> {
        let (message, _status) = self
            .comm
            .process_at_rank(source)
            .receive_vec_with_tag::<u8>(tag);
        message
    }
}
