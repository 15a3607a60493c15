//! Ownership of regions by processes.
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    partition::tables::FlatIndex,
};

/// How regions are handed out to processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Explicit owner per region, indexed by region id.
    UserDefined(Vec<usize>),
    /// Region `i` goes to process `i % P`.
    RoundRobin,
    /// Regions in id order are cut into `P` runs of near-equal length.
    Contiguous,
    /// Declared for completeness, has no cost model and always fails.
    MinimizeDataMovement,
}

/// The serialisable subset of [`AssignmentPolicy`] used in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    RoundRobin,
    #[default]
    Contiguous,
    MinimizeDataMovement,
}

impl From<AssignmentKind> for AssignmentPolicy {
    fn from(kind: AssignmentKind) -> Self {
        match kind {
            AssignmentKind::RoundRobin => AssignmentPolicy::RoundRobin,
            AssignmentKind::Contiguous => AssignmentPolicy::Contiguous,
            AssignmentKind::MinimizeDataMovement => AssignmentPolicy::MinimizeDataMovement,
        }
    }
}

/// Owner of each region, plus the inverse lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    nprocs: usize,
    owners: Vec<usize>,
    by_process: FlatIndex,
}

impl Assignment {
    /// Apply `policy` to `nregions` regions over `nprocs` processes.
    pub fn compute(policy: &AssignmentPolicy, nregions: usize, nprocs: usize) -> Result<Self> {
        if nprocs == 0 {
            return Err(Error::InvalidAssignment("no processes to assign to".to_string()));
        }

        let owners = match policy {
            AssignmentPolicy::UserDefined(map) => {
                if map.len() != nregions {
                    return Err(Error::InvalidAssignment(format!(
                        "map has {} entries for {} regions",
                        map.len(),
                        nregions
                    )));
                }
                if let Some((region, owner)) = map.iter().enumerate().find(|(_, &p)| p >= nprocs) {
                    return Err(Error::InvalidAssignment(format!(
                        "region {} assigned to process {} of {}",
                        region, owner, nprocs
                    )));
                }
                map.clone()
            }
            AssignmentPolicy::RoundRobin => (0..nregions).map(|region| region % nprocs).collect(),
            AssignmentPolicy::Contiguous => {
                let (base, extra) = (nregions / nprocs, nregions % nprocs);
                (0..nprocs)
                    .flat_map(|process| {
                        let run = base + usize::from(process < extra);
                        std::iter::repeat(process).take(run)
                    })
                    .collect()
            }
            AssignmentPolicy::MinimizeDataMovement => {
                return Err(Error::NotImplemented("minimize data movement assignment"))
            }
        };

        let by_process = FlatIndex::from_lists((0..nprocs).map(|process| {
            owners
                .iter()
                .enumerate()
                .filter(|(_, &owner)| owner == process)
                .map(|(region, _)| region)
                .collect::<Vec<_>>()
        }));

        Ok(Assignment {
            nprocs,
            owners,
            by_process,
        })
    }

    pub fn number_of_processes(&self) -> usize {
        self.nprocs
    }

    /// Owner per region id.
    pub fn owners(&self) -> &[usize] {
        &self.owners
    }

    pub fn owner(&self, region: usize) -> Option<usize> {
        self.owners.get(region).copied()
    }

    /// Regions owned by `process`, in id order.
    pub fn regions_of(&self, process: usize) -> Option<&[usize]> {
        self.by_process.get(process)
    }
}
