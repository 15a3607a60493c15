//! Definition of basic types
pub mod bounds;
pub mod dataset;
pub mod topology;
