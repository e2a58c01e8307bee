//! Plan configuration

mod plan;

pub use plan::*;
