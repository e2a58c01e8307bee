//! partplan library - installer partition planning

pub mod config;
pub mod disk;
pub mod install;
pub mod utils;

pub use config::PlanConfig;
pub use utils::error::PlanError;
