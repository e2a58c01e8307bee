//! Planning sessions and the installer hand-off

mod planner;
mod target;

pub use planner::*;
pub use target::*;
