//! Resolved partition list handed to the rest of the installer

use crate::disk::scheme::{sectors_to_mib, FsType, GenericPartType, PartId, Sectors};
use crate::disk::usage::{InstallFlags, PartitionUsageSet, Placement};
use crate::utils::error::{PlanError, Result};
use serde::Serialize;

/// One partition (or RAM-backed mount) the installer has to deal with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallPartition {
    pub mount: String,
    #[serde(rename = "type")]
    pub generic_type: GenericPartType,
    pub fs: FsType,
    pub fs_version: u32,
    /// Physical id in the planned scheme, if the entry got a partition
    pub part_id: Option<PartId>,
    pub start: Sectors,
    /// Sectors, or a negated percentage of RAM for tmpfs-like mounts
    pub size: Sectors,
    pub flags: InstallFlags,
    /// Also present in the outer scheme
    pub outer: bool,
    /// Source partition (`scheme@start`) whose data is copied in
    pub clone_of: Option<String>,
}

impl InstallPartition {
    pub fn is_materialized(&self) -> bool {
        self.part_id.is_some()
    }

    fn needs_partition(&self) -> bool {
        match self.generic_type {
            GenericPartType::Swap => true,
            GenericPartType::Root => !self.mount.is_empty() && !self.fs.is_ram_backed(),
            _ => false,
        }
    }
}

/// Flat, resolved view of a usage set after allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstallPartitionDesc {
    pub scheme: String,
    pub sector_size: i64,
    pub partitions: Vec<InstallPartition>,
}

impl InstallPartitionDesc {
    pub fn from_set(set: &PartitionUsageSet, scheme: &str, sector_size: i64) -> Self {
        let partitions = set
            .entries
            .iter()
            .filter(|e| !e.cur_flags.scheme_internal)
            .filter(|e| e.is_materialized() || e.size != 0)
            .map(|e| InstallPartition {
                mount: e.mount.clone(),
                generic_type: e.generic_type,
                fs: e.fs_type,
                fs_version: e.fs_version,
                part_id: e.cur_part_id,
                start: e.cur_start,
                size: e.size,
                flags: e.inst_flags,
                outer: matches!(e.placement, Placement::Outer { .. }),
                clone_of: e.clone.as_ref().and_then(|c| {
                    c.selected()
                        .map(|p| format!("{}@{}", c.source.scheme, p.start))
                }),
            })
            .collect();
        InstallPartitionDesc {
            scheme: scheme.to_string(),
            sector_size,
            partitions,
        }
    }

    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn root(&self) -> Option<&InstallPartition> {
        self.partitions.iter().find(|p| p.mount == "/")
    }

    /// Post-allocation check: every mount-bearing root-type entry and every
    /// swap entry got a partition, and there is a `/`
    pub fn verify(&self) -> Result<()> {
        let missing: Vec<String> = self
            .partitions
            .iter()
            .filter(|p| p.needs_partition() && !p.is_materialized())
            .map(|p| {
                if p.mount.is_empty() {
                    p.generic_type.to_string()
                } else {
                    p.mount.clone()
                }
            })
            .collect();
        if !missing.is_empty() {
            return Err(PlanError::AllocationShortfall(missing.join(", ")));
        }
        match self.root() {
            Some(root) if root.is_materialized() => Ok(()),
            _ => Err(PlanError::MissingRoot),
        }
    }
}

/// Print a table of the planned partitions
pub fn print_layout_summary(desc: &InstallPartitionDesc) {
    println!("\nPartition layout ({}):", desc.scheme);
    println!(
        "{:<4} {:<12} {:<8} {:>12} {:>12} {:<6}",
        "ID", "MOUNT", "FS", "START", "SIZE", "FLAGS"
    );
    println!("{}", "-".repeat(60));

    for part in &desc.partitions {
        let id = part
            .part_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let size_str = if part.fs.is_ram_backed() {
            format!("{}% RAM", -part.size)
        } else {
            format!("{} MiB", sectors_to_mib(part.size, desc.sector_size))
        };
        let start_str = if part.is_materialized() {
            part.start.to_string()
        } else {
            "-".to_string()
        };
        let mut flags = String::new();
        if part.flags.newfs {
            flags.push('N');
        }
        if part.flags.mount {
            flags.push('M');
        }
        if part.flags.boot {
            flags.push('B');
        }
        if part.outer {
            flags.push('O');
        }
        if part.clone_of.is_some() {
            flags.push('C');
        }
        let mount = if part.mount.is_empty() {
            part.generic_type.to_string()
        } else {
            part.mount.clone()
        };

        println!(
            "{:<4} {:<12} {:<8} {:>12} {:>12} {:<6}",
            id, mount, part.fs, start_str, size_str, flags
        );
    }
    println!();
}
