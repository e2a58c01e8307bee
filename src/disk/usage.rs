//! Wanted partition layout
//!
//! A [`PartitionUsageSet`] is the planner's picture of the disk: every
//! partition the user wants, whether it already exists or not. Entries are
//! linked to physical partitions through `cur_part_id`, which is only
//! trustworthy until the next mutation of the owning scheme.

use crate::disk::scheme::{
    DiskPartInfo, DiskSchemes, FsType, GenericPartType, PartId, PartInfoFlags, SchemeOwner,
    Sectors,
};
use crate::utils::error::{PlanError, Result};
use std::rc::Rc;

/// Where an entry lives, or will live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placement {
    /// A partition of the planned (inner) scheme
    #[default]
    Inner,
    /// To be created in the outer scheme first, then mirrored inside
    AddOuter,
    /// Exists in the outer scheme; `add_inner` asks for an inner mirror
    Outer { add_inner: bool },
    /// Only a mount point (tmpfs, mfs), never a partition
    MountpointOnly,
}

/// Install-time actions for an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InstallFlags {
    pub mount: bool,
    pub boot: bool,
    pub newfs: bool,
}

/// Partitions whose content should be copied into new partitions
#[derive(Debug, Clone, PartialEq)]
pub struct CloneSource {
    /// Scheme the sources were read from
    pub scheme: String,
    /// Source descriptors, in selection order
    pub parts: Vec<DiskPartInfo>,
    /// Copy the data too, not only the allocation
    pub with_data: bool,
}

/// Clone request of an entry: all of `source`, or the single source
/// `index` once the request has been normalized
#[derive(Debug, Clone, PartialEq)]
pub struct CloneSelection {
    pub source: Rc<CloneSource>,
    pub index: Option<usize>,
}

impl CloneSelection {
    /// Request covering every partition of `source`
    pub fn all(source: Rc<CloneSource>) -> Self {
        CloneSelection {
            source,
            index: None,
        }
    }

    /// The one source partition this entry copies
    pub fn selected(&self) -> Option<&DiskPartInfo> {
        match self.index {
            Some(i) => self.source.parts.get(i),
            None if self.source.parts.len() == 1 => self.source.parts.first(),
            None => None,
        }
    }
}

/// One desired or already existing partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionUsageInfo {
    /// Wanted size in sectors; a percentage of RAM when negative on a
    /// RAM-backed entry
    pub size: Sectors,
    /// Suggested size offered while `size` is still 0
    pub def_size: Sectors,
    /// Absolute sector the partition must end before (0: unlimited)
    pub limit: Sectors,
    pub mount: String,
    pub generic_type: GenericPartType,
    pub fs_type: FsType,
    pub fs_version: u32,
    pub fs_opt1: u32,
    pub fs_opt2: u32,
    pub fs_opt3: u32,
    pub placement: Placement,
    extend: bool,
    pub inst_flags: InstallFlags,
    pub cur_part_id: Option<PartId>,
    pub cur_start: Sectors,
    pub cur_flags: PartInfoFlags,
    pub owner: SchemeOwner,
    pub clone: Option<CloneSelection>,
}

impl PartitionUsageInfo {
    /// A new, not yet materialized entry
    pub fn new(mount: &str, generic_type: GenericPartType, fs_type: FsType) -> Self {
        PartitionUsageInfo {
            mount: mount.to_string(),
            generic_type,
            fs_type,
            placement: if fs_type.is_ram_backed() {
                Placement::MountpointOnly
            } else {
                Placement::Inner
            },
            ..Default::default()
        }
    }

    /// Entry describing an existing physical partition
    pub fn from_part_info(owner: SchemeOwner, id: PartId, info: &DiskPartInfo) -> Self {
        let mut entry = PartitionUsageInfo {
            size: info.size,
            generic_type: info.generic_type,
            fs_type: info.fs_type,
            fs_version: info.fs_version,
            fs_opt1: info.fs_opt1,
            fs_opt2: info.fs_opt2,
            fs_opt3: info.fs_opt3,
            cur_part_id: Some(id),
            cur_start: info.start,
            cur_flags: info.flags,
            owner,
            ..Default::default()
        };
        if let Some(mount) = info.mounted_on() {
            entry.mount = mount.to_string();
            entry.inst_flags.mount = entry.fs_type.is_mountable();
        }
        entry
    }

    pub fn with_size(mut self, size: Sectors) -> Self {
        self.size = size;
        self
    }

    pub fn with_def_size(mut self, def_size: Sectors) -> Self {
        self.def_size = def_size;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Builder form of [`set_extend`](Self::set_extend); a mount-point-only
    /// entry silently stays non-extending
    pub fn extending(mut self) -> Self {
        let _ = self.set_extend(true);
        self
    }

    pub fn extend(&self) -> bool {
        self.extend
    }

    pub(crate) fn clear_extend(&mut self) {
        self.extend = false;
    }

    /// Mark the entry as the one absorbing leftover space
    pub fn set_extend(&mut self, extend: bool) -> Result<()> {
        if extend && self.placement == Placement::MountpointOnly {
            return Err(PlanError::InvariantViolation(format!(
                "mount point {} cannot extend",
                self.display_name()
            )));
        }
        self.extend = extend;
        Ok(())
    }

    pub fn is_materialized(&self) -> bool {
        self.cur_part_id.is_some()
    }

    pub fn is_outer(&self) -> bool {
        matches!(self.placement, Placement::Outer { .. })
    }

    pub fn just_mountpoint(&self) -> bool {
        self.placement == Placement::MountpointOnly
    }

    /// Size refers to RAM, not to disk sectors
    pub fn is_ram_backed(&self) -> bool {
        self.fs_type.is_ram_backed()
    }

    /// Whether the entry takes space from the planned scheme's free pool
    pub fn counts_against_free_space(&self) -> bool {
        !matches!(
            self.placement,
            Placement::MountpointOnly | Placement::Outer { add_inner: false }
        )
    }

    /// Size to show: the wanted size, or the suggestion when undecided
    pub fn effective_size(&self) -> Sectors {
        if self.size == 0 {
            self.def_size
        } else {
            self.size
        }
    }

    /// Descriptor to hand to a backend for creating this entry
    pub fn to_part_info(&self, start: Sectors, size: Sectors) -> DiskPartInfo {
        let generic_type = match self.generic_type {
            GenericPartType::Undef => self.fs_type.generic_type(),
            t => t,
        };
        DiskPartInfo {
            start,
            size,
            generic_type,
            fs_type: self.fs_type,
            fs_version: self.fs_version,
            fs_opt1: self.fs_opt1,
            fs_opt2: self.fs_opt2,
            fs_opt3: self.fs_opt3,
            last_mounted: (!self.mount.is_empty()).then(|| self.mount.clone()),
            flags: PartInfoFlags {
                boot: self.inst_flags.boot,
                ..Default::default()
            },
        }
    }

    /// Mount point, or the type when there is none
    pub fn display_name(&self) -> String {
        if self.mount.is_empty() {
            self.generic_type.to_string()
        } else {
            self.mount.clone()
        }
    }

    /// Newly created filesystems get formatted, and mounted when they
    /// have a mount point
    pub(crate) fn mark_new_filesystem(&mut self) {
        if self.fs_type.is_mountable() && self.generic_type != GenericPartType::Swap {
            self.inst_flags.newfs = true;
            if !self.mount.is_empty() {
                self.inst_flags.mount = true;
            }
        }
    }
}

/// The whole wanted layout of one planned scheme
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionUsageSet {
    pub entries: Vec<PartitionUsageInfo>,
    /// Sectors kept out of free space accounting
    pub reserved_space: Sectors,
    /// Space left after all wanted entries; negative when over-committed
    pub cur_free_space: Sectors,
}

impl PartitionUsageSet {
    /// Lift an existing table 1:1 into a usage set
    pub fn from_scheme(schemes: &DiskSchemes, reserved_space: Sectors) -> Self {
        let inner = schemes.inner.as_ref();
        let entries = (0..inner.num_part())
            .filter_map(|id| {
                inner
                    .get_part_info(id)
                    .map(|info| PartitionUsageInfo::from_part_info(SchemeOwner::Inner, id, &info))
            })
            .collect();
        PartitionUsageSet {
            entries,
            reserved_space,
            cur_free_space: inner.free_space() - reserved_space,
        }
    }

    /// Index of the first entry mounted at `mount`
    pub fn find_mount(&self, mount: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.mount == mount)
    }

    /// Index of the entry holding the extend flag
    pub fn extend_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.extend())
    }

    /// Move the extend flag to entry `idx` (or drop it everywhere)
    pub fn set_extend(&mut self, idx: Option<usize>) -> Result<()> {
        if let Some(i) = idx {
            self.entries[i].set_extend(true)?;
        }
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if Some(i) != idx {
                entry.extend = false;
            }
        }
        Ok(())
    }

    /// Check the structural invariants the planner relies on
    pub fn validate(&self) -> Result<()> {
        let extends = self.entries.iter().filter(|e| e.extend()).count();
        if extends > 1 {
            return Err(PlanError::InvariantViolation(format!(
                "{} entries hold the extend flag",
                extends
            )));
        }
        if let Some(e) = self.entries.iter().find(|e| e.extend() && e.just_mountpoint()) {
            return Err(PlanError::InvariantViolation(format!(
                "mount point {} cannot extend",
                e.display_name()
            )));
        }
        Ok(())
    }

    /// Sum of wanted sizes not yet backed by a partition
    pub fn unmaterialized_space(&self) -> Sectors {
        self.entries
            .iter()
            .filter(|e| !e.is_materialized() && e.counts_against_free_space() && e.size > 0)
            .map(|e| e.size)
            .sum()
    }

    /// Recompute `cur_free_space` from the inner scheme's free space
    pub fn recompute_free_space(&mut self, schemes: &DiskSchemes) {
        self.cur_free_space =
            schemes.inner.free_space() - self.reserved_space - self.unmaterialized_space();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountpoint_cannot_extend() {
        let mut tmp = PartitionUsageInfo::new("/tmp", GenericPartType::Root, FsType::Tmpfs);
        assert!(tmp.just_mountpoint());
        assert!(tmp.set_extend(true).is_err());
        assert!(!tmp.extend());
    }

    #[test]
    fn set_extend_keeps_a_single_flag() {
        let mut set = PartitionUsageSet {
            entries: vec![
                PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs).extending(),
                PartitionUsageInfo::new("/usr", GenericPartType::Root, FsType::Ffs),
            ],
            ..Default::default()
        };
        set.set_extend(Some(1)).unwrap();
        assert_eq!(set.extend_index(), Some(1));
        assert_eq!(set.entries.iter().filter(|e| e.extend()).count(), 1);
        set.validate().unwrap();
    }

    #[test]
    fn validate_rejects_two_extend_entries() {
        let set = PartitionUsageSet {
            entries: vec![
                PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs).extending(),
                PartitionUsageInfo::new("/usr", GenericPartType::Root, FsType::Ffs).extending(),
            ],
            ..Default::default()
        };
        assert!(matches!(set.validate(), Err(PlanError::InvariantViolation(_))));
    }

    #[test]
    fn outer_only_entries_do_not_count() {
        let set = PartitionUsageSet {
            entries: vec![
                PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs).with_size(100),
                PartitionUsageInfo::new("", GenericPartType::Fat, FsType::Msdos)
                    .with_size(50)
                    .with_placement(Placement::Outer { add_inner: false }),
                PartitionUsageInfo::new("/boot", GenericPartType::Fat, FsType::Msdos)
                    .with_size(20)
                    .with_placement(Placement::Outer { add_inner: true }),
                PartitionUsageInfo::new("/tmp", GenericPartType::Root, FsType::Tmpfs).with_size(-25),
            ],
            ..Default::default()
        };
        assert_eq!(set.unmaterialized_space(), 120);
    }

    #[test]
    fn new_filesystem_flags() {
        let mut swap = PartitionUsageInfo::new("", GenericPartType::Swap, FsType::Swap);
        swap.mark_new_filesystem();
        assert_eq!(swap.inst_flags, InstallFlags::default());

        let mut usr = PartitionUsageInfo::new("/usr", GenericPartType::Root, FsType::Ffs);
        usr.mark_new_filesystem();
        assert!(usr.inst_flags.newfs);
        assert!(usr.inst_flags.mount);
    }
}
