//! Reshaping delivered pieces so that each process holds the cells of the regions it owns.
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    comm::{Communicator, Rank},
    constants::REDISTRIBUTE_TAG,
    error::{Error, Result},
    moving::marshal::{marshal, unmarshal},
    partition::tree::PartitionTree,
    subgroup::SubGroup,
    types::dataset::{Dataset, DatasetKind},
};

/// What happens to cells that straddle region boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// A cell goes to the owner of the region containing its center.
    #[default]
    AssignToOneRegion,
    /// A cell goes to the owner of every region its bounds touch.
    DuplicateBoundaryCells,
}

pub trait Redistributor {
    /// Return this process's share of `dataset` under `tree`'s region assignment.
    /// Collective over `comm`.
    fn redistribute<C: Communicator>(&self, comm: &C, tree: &PartitionTree, dataset: &Dataset) -> Result<Dataset>;
}

/// Routes cells to region owners with an all-to-all exchange.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionRedistributor {
    mode: BoundaryMode,
}

impl RegionRedistributor {
    pub fn new(mode: BoundaryMode) -> Self {
        RegionRedistributor { mode }
    }

    /// Destination processes of every cell.
    fn destinations(&self, tree: &PartitionTree, dataset: &Dataset, owners: &[usize], me: usize, nprocs: usize) -> Vec<Vec<usize>> {
        let mut cells = vec![Vec::new(); nprocs];

        // Structured grids cannot be cut per cell and stay where they are.
        if dataset.kind() == DatasetKind::ImageGrid {
            cells[me] = (0..dataset.number_of_cells()).collect();
            return cells;
        }

        for (cell, center) in dataset.cell_centers().iter().enumerate() {
            let home = owners[tree.locate(center)];
            match self.mode {
                BoundaryMode::AssignToOneRegion => cells[home].push(cell),
                BoundaryMode::DuplicateBoundaryCells => {
                    let touched = tree
                        .regions_intersecting(&dataset.cell_bounds(cell))
                        .into_iter()
                        .map(|region| owners[region])
                        .chain(std::iter::once(home))
                        .sorted()
                        .dedup();
                    for owner in touched {
                        cells[owner].push(cell);
                    }
                }
            }
        }
        cells
    }
}

impl Redistributor for RegionRedistributor {
    fn redistribute<C: Communicator>(&self, comm: &C, tree: &PartitionTree, dataset: &Dataset) -> Result<Dataset> {
        let group = SubGroup::whole(comm, REDISTRIBUTE_TAG)?;
        let nprocs = group.members();
        let owners = tree.assignment_map()?;
        if let Some(&owner) = owners.iter().find(|&&owner| owner >= nprocs) {
            warn!(owner, nprocs, "region owned by a process outside the group");
            return Err(Error::InvalidProcess(owner as Rank));
        }

        let me = group.member_rank();
        let destinations = self.destinations(tree, dataset, owners, me, nprocs);
        let outgoing = destinations
            .iter()
            .map(|ids| {
                if ids.is_empty() {
                    Ok(Vec::new())
                } else {
                    marshal(&dataset.extract_cells(ids), None)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let incoming = group.exchange(outgoing);
        let pieces = incoming
            .iter()
            .filter(|block| !block.is_empty())
            .map(|block| unmarshal(block))
            .collect::<Result<Vec<_>>>()?;

        let kept = Dataset::merge(pieces)?.unwrap_or_else(|| dataset.empty_like());
        debug!(
            mode = ?self.mode,
            before = dataset.number_of_cells(),
            after = kept.number_of_cells(),
            "redistributed"
        );
        Ok(kept)
    }
}
