//! Moving datasets between the processes and roles of a session.
pub mod marshal;
pub mod mover;
pub mod plan;

pub use marshal::WireBuffer;
pub use mover::{DataMover, MoveOutput, MoverConfig};
pub use plan::{plan, MoveMode, MovePlan, Step};
