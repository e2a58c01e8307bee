//! Disk partition planning

pub mod clones;
pub mod detection;
pub mod editor;
pub mod layouts;
pub mod memory;
pub mod partitioning;
pub mod scheme;
pub mod sync;
pub mod usage;
