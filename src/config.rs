//! Runtime configuration, loadable from JSON.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    constants::DEFAULT_COMPRESSION_LEVEL,
    delivery::redistribute::BoundaryMode,
    error::Result,
    moving::mover::MoverConfig,
    partition::assignment::AssignmentKind,
};

/// Settings of the partition-tree builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Regions to create; one per process when unset.
    pub number_of_regions: Option<usize>,
    /// Let ghost cells take part in the split and count towards region tables.
    pub include_ghost_cells: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// zlib-compress marshalled blocks.
    pub compress: bool,
    pub compression_level: u32,
    /// Streamable items are delivered piece by piece instead of in full.
    pub streaming: bool,
    pub boundary_mode: BoundaryMode,
    pub assignment: AssignmentKind,
    pub build: BuildConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            compress: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            streaming: false,
            boundary_mode: BoundaryMode::default(),
            assignment: AssignmentKind::default(),
            build: BuildConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        DeliveryConfig::from_json_str(&contents)
    }

    /// Mover settings for one item.
    pub fn mover_config(&self, gather_for_client: bool) -> MoverConfig {
        MoverConfig {
            compress: self.compress,
            compression_level: self.compression_level,
            gather_for_client,
        }
    }
}
