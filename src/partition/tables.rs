//! Region/process bookkeeping shared by every process after a build.
//!
//! Lists are kept in arena form: one entry array plus a `(start, count)` range per key.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    comm::{Communicator, Rank},
    constants::TABLES_TAG,
    error::{Error, Result},
    partition::tree::PartitionTree,
    subgroup::SubGroup,
    types::dataset::Coordinate,
};

/// Variable-length lists of indices stored contiguously.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatIndex {
    entries: Vec<usize>,
    ranges: Vec<(usize, usize)>,
}

impl FlatIndex {
    pub fn from_lists<I, L>(lists: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: IntoIterator<Item = usize>,
    {
        let mut index = FlatIndex::default();
        for list in lists {
            let start = index.entries.len();
            index.entries.extend(list);
            index.ranges.push((start, index.entries.len() - start));
        }
        index
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, key: usize) -> Option<&[usize]> {
        self.ranges
            .get(key)
            .map(|&(start, count)| &self.entries[start..start + count])
    }
}

/// Which processes hold cells in which regions, and how many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionTables {
    nregions: usize,
    nprocs: usize,
    include_ghost_cells: bool,
    /// `[process][region][owned, ghost]`, flattened.
    counts: Vec<u64>,
    processes_for_region: FlatIndex,
    processes_for_region_with_ghosts: FlatIndex,
    regions_for_process: FlatIndex,
}

impl RegionTables {
    /// Count every process's cells per region, then share the tables with all processes.
    ///
    /// `centers` are the local cell centers and `ghost` their ghost flags (empty when
    /// there are none). Collective over `comm`.
    pub fn build<C: Communicator>(
        comm: &C,
        tree: &PartitionTree,
        centers: &[Coordinate],
        ghost: &[bool],
        include_ghost_cells: bool,
    ) -> Result<Self> {
        let group = SubGroup::whole(comm, TABLES_TAG)?;
        let nregions = tree.number_of_regions();
        let nprocs = group.members();

        let mut local = vec![0u64; 2 * nregions];
        for (i, center) in centers.iter().enumerate() {
            let region = tree.locate(center);
            let is_ghost = ghost.get(i).copied().unwrap_or(false);
            local[2 * region + usize::from(is_ghost)] += 1;
        }

        let pattern = group.set_up_root(0, 2 * nregions);
        let gathered = group.gather(&pattern, &local).unwrap_or_default();
        let counts = group.broadcast(&gathered, 0);

        let tables = RegionTables::from_counts(counts, nregions, nprocs, include_ghost_cells);
        debug!(
            nregions,
            nprocs,
            entries = tables.processes_for_region_with_ghosts.entries.len(),
            "region tables"
        );
        Ok(tables)
    }

    fn from_counts(counts: Vec<u64>, nregions: usize, nprocs: usize, include_ghost_cells: bool) -> Self {
        let at = |process: usize, region: usize, slot: usize| counts[2 * (process * nregions + region) + slot];

        let processes_for_region = FlatIndex::from_lists(
            (0..nregions).map(|r| (0..nprocs).filter(move |&p| at(p, r, 0) > 0).collect::<Vec<_>>()),
        );
        let processes_for_region_with_ghosts = FlatIndex::from_lists((0..nregions).map(|r| {
            (0..nprocs)
                .filter(move |&p| at(p, r, 0) + at(p, r, 1) > 0)
                .collect::<Vec<_>>()
        }));
        let regions_for_process = FlatIndex::from_lists((0..nprocs).map(|p| {
            (0..nregions)
                .filter(move |&r| at(p, r, 0) > 0 || (include_ghost_cells && at(p, r, 1) > 0))
                .collect::<Vec<_>>()
        }));

        RegionTables {
            nregions,
            nprocs,
            include_ghost_cells,
            counts,
            processes_for_region,
            processes_for_region_with_ghosts,
            regions_for_process,
        }
    }

    fn check_region(&self, region: usize) -> Result<()> {
        if region < self.nregions {
            Ok(())
        } else {
            Err(Error::InvalidRegion(region))
        }
    }

    fn check_process(&self, process: usize) -> Result<()> {
        if process < self.nprocs {
            Ok(())
        } else {
            Err(Error::InvalidProcess(process as Rank))
        }
    }

    pub fn number_of_processes(&self) -> usize {
        self.nprocs
    }

    /// Processes holding at least one non-ghost cell in `region`.
    pub fn process_list(&self, region: usize) -> Result<&[usize]> {
        self.processes_for_region
            .get(region)
            .ok_or(Error::InvalidRegion(region))
    }

    /// Processes holding any cell, ghost or not, in `region`.
    pub fn process_list_with_ghosts(&self, region: usize) -> Result<&[usize]> {
        self.processes_for_region_with_ghosts
            .get(region)
            .ok_or(Error::InvalidRegion(region))
    }

    /// Regions in which `process` holds cells.
    pub fn region_list(&self, process: usize) -> Result<&[usize]> {
        self.regions_for_process
            .get(process)
            .ok_or(Error::InvalidProcess(process as Rank))
    }

    /// Cells of `process` in `region`; ghost cells count when the tables were built with
    /// ghost cells included.
    pub fn cell_count(&self, region: usize, process: usize) -> Result<u64> {
        self.check_region(region)?;
        self.check_process(process)?;
        let base = 2 * (process * self.nregions + region);
        let ghost = if self.include_ghost_cells {
            self.counts[base + 1]
        } else {
            0
        };
        Ok(self.counts[base] + ghost)
    }

    pub fn total_cells_in_region(&self, region: usize) -> Result<u64> {
        (0..self.nprocs).map(|p| self.cell_count(region, p)).sum()
    }

    pub fn total_cells_on_process(&self, process: usize) -> Result<u64> {
        (0..self.nregions).map(|r| self.cell_count(r, process)).sum()
    }
}
