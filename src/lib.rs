//! Distributed k-d partitioning of spatial data and per-frame delivery of datasets between
//! the client, data-server and render-server processes of a visualization session.
pub mod c_api;
pub mod comm;
pub mod config;
pub mod constants;
pub mod data;
pub mod delivery;
pub mod error;
pub mod moving;
pub mod partition;
pub mod subgroup;
pub mod types;

pub use error::{Error, Result};
