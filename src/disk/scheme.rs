//! Partitioning scheme capability surface
//!
//! The planner never touches a partition table directly. Every concrete
//! scheme (MBR, GPT, disklabel, or the in-memory [`MemoryScheme`]) is driven
//! through [`PartitionSpaceBackend`], and a planning session owns its
//! scheme instances through [`DiskSchemes`].
//!
//! [`MemoryScheme`]: crate::disk::memory::MemoryScheme

use crate::utils::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sector counts and sector addresses. Signed: negative sizes carry
/// meaning on RAM-backed entries, and free space may be over-committed.
pub type Sectors = i64;

/// Index of a partition in its scheme's table. Only valid until the next
/// mutation of that scheme.
pub type PartId = usize;

/// Scheme independent partition classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenericPartType {
    #[default]
    Undef,
    Unknown,
    Root,
    Swap,
    Fat,
    Ext2,
    EfiSystem,
    Boot,
    /// Container holding a nested (inner) partitioning scheme
    SecondaryContainer,
}

impl fmt::Display for GenericPartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => write!(f, "unused"),
            Self::Unknown => write!(f, "unknown"),
            Self::Root => write!(f, "root"),
            Self::Swap => write!(f, "swap"),
            Self::Fat => write!(f, "fat"),
            Self::Ext2 => write!(f, "ext2"),
            Self::EfiSystem => write!(f, "efi"),
            Self::Boot => write!(f, "boot"),
            Self::SecondaryContainer => write!(f, "container"),
        }
    }
}

/// Filesystem kinds the planner knows how to place
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Unused,
    Ffs,
    Lfs,
    Swap,
    Msdos,
    Ext2fs,
    Tmpfs,
    Mfs,
}

impl FsType {
    /// Lives in memory; sizes are a share of RAM, not sectors
    pub fn is_ram_backed(&self) -> bool {
        matches!(self, Self::Tmpfs | Self::Mfs)
    }

    /// Carries a filesystem that can be created and mounted
    pub fn is_mountable(&self) -> bool {
        !matches!(self, Self::Unused | Self::Swap)
    }

    /// Generic partition type a new partition of this kind gets
    pub fn generic_type(&self) -> GenericPartType {
        match self {
            Self::Unused => GenericPartType::Undef,
            Self::Ffs | Self::Lfs | Self::Tmpfs | Self::Mfs => GenericPartType::Root,
            Self::Swap => GenericPartType::Swap,
            Self::Msdos => GenericPartType::Fat,
            Self::Ext2fs => GenericPartType::Ext2,
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "-"),
            Self::Ffs => write!(f, "ffs"),
            Self::Lfs => write!(f, "lfs"),
            Self::Swap => write!(f, "swap"),
            Self::Msdos => write!(f, "msdos"),
            Self::Ext2fs => write!(f, "ext2fs"),
            Self::Tmpfs => write!(f, "tmpfs"),
            Self::Mfs => write!(f, "mfs"),
        }
    }
}

/// Per-partition flags reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartInfoFlags {
    /// Marked bootable/active
    pub boot: bool,
    /// Backend's guess for the install target
    pub install_target: bool,
    /// Scheme bookkeeping (raw/whole-disk entries), never user data
    pub scheme_internal: bool,
    /// Holds a nested partitioning scheme
    pub sec_container: bool,
}

/// Backend descriptor of one physical partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskPartInfo {
    pub start: Sectors,
    pub size: Sectors,
    #[serde(default, rename = "type")]
    pub generic_type: GenericPartType,
    #[serde(default, rename = "fs")]
    pub fs_type: FsType,
    #[serde(default)]
    pub fs_version: u32,
    #[serde(default)]
    pub fs_opt1: u32,
    #[serde(default)]
    pub fs_opt2: u32,
    #[serde(default)]
    pub fs_opt3: u32,
    /// Mount point the filesystem was last mounted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mounted: Option<String>,
    #[serde(default)]
    pub flags: PartInfoFlags,
}

impl DiskPartInfo {
    /// First sector past the partition
    pub fn end(&self) -> Sectors {
        self.start + self.size
    }

    /// Last mounted label, if it is non-empty
    pub fn mounted_on(&self) -> Option<&str> {
        self.last_mounted.as_deref().filter(|m| !m.is_empty())
    }
}

/// A contiguous unused range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpace {
    pub start: Sectors,
    pub size: Sectors,
}

/// Capability surface of one partitioning scheme instance
pub trait PartitionSpaceBackend {
    /// Short scheme name (e.g. "mbr", "gpt", "disklabel")
    fn scheme_name(&self) -> &str;

    /// First sector of the region this scheme manages
    fn disk_start(&self) -> Sectors;

    /// Size of the managed region
    fn disk_size(&self) -> Sectors;

    /// Unallocated sectors within the managed region
    fn free_space(&self) -> Sectors;

    fn num_part(&self) -> usize;

    /// Granularity for partition start and size
    fn part_alignment(&self) -> Sectors;

    fn get_part_info(&self, id: PartId) -> Option<DiskPartInfo>;

    fn set_part_info(&mut self, id: PartId, info: &DiskPartInfo) -> Result<()>;

    fn add_partition(&mut self, info: &DiskPartInfo) -> Result<PartId>;

    /// Whether [`add_outer_partition`](Self::add_outer_partition) has its own
    /// semantics for this scheme
    fn supports_outer_partitions(&self) -> bool {
        false
    }

    /// Add a partition mirroring one of the parent scheme
    fn add_outer_partition(&mut self, info: &DiskPartInfo) -> Result<PartId> {
        self.add_partition(info)
    }

    fn delete_partition(&mut self, id: PartId) -> Result<()>;

    fn delete_all_partitions(&mut self) -> Result<()>;

    /// Delete every non-internal partition lying inside `[start, start+size)`
    fn delete_partitions_in_range(&mut self, start: Sectors, size: Sectors) -> Result<()> {
        let end = start + size;
        let mut id = self.num_part();
        while id > 0 {
            id -= 1;
            let Some(info) = self.get_part_info(id) else {
                continue;
            };
            if info.flags.scheme_internal {
                continue;
            }
            if info.start >= start && info.end() <= end {
                self.delete_partition(id)?;
            }
        }
        Ok(())
    }

    /// Up to `max` free ranges of at least `min_size` sectors, starts aligned
    /// to `align`, beginning no earlier than `from` (and ending before `to`
    /// when given)
    fn get_free_spaces(
        &self,
        max: usize,
        min_size: Sectors,
        align: Sectors,
        from: Sectors,
        to: Option<Sectors>,
    ) -> Vec<FreeSpace>;

    /// Largest size a partition starting at `start` could grow to
    fn max_free_space_at(&self, start: Sectors) -> Sectors;

    /// Open the nested scheme living in the container partition at `start`
    fn secondary_partitions(
        &mut self,
        _start: Sectors,
        _force_empty: bool,
    ) -> Option<Box<dyn PartitionSpaceBackend>> {
        None
    }

    /// Backend's idea of where an installation should go
    fn guess_install_target(&self) -> Option<(Sectors, Sectors)> {
        None
    }

    /// Translate a descriptor from another scheme into this one's terms
    fn adapt_foreign_part_info(
        &self,
        _foreign_scheme: &str,
        foreign: &DiskPartInfo,
    ) -> Option<DiskPartInfo> {
        let mut info = foreign.clone();
        info.flags = PartInfoFlags::default();
        if info.generic_type == GenericPartType::SecondaryContainer {
            return None;
        }
        if info.generic_type == GenericPartType::Undef {
            info.generic_type = info.fs_type.generic_type();
        }
        Some(info)
    }
}

/// Which scheme instance of a session owns an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeOwner {
    #[default]
    Inner,
    Outer,
}

/// The scheme instances one planning session has exclusive use of
///
/// `inner` is the scheme the layout is planned in; `outer` is its parent
/// (e.g. an MBR holding a disklabel), when the disk is hybrid.
pub struct DiskSchemes {
    pub inner: Box<dyn PartitionSpaceBackend>,
    pub outer: Option<Box<dyn PartitionSpaceBackend>>,
}

impl DiskSchemes {
    /// A session on a single, non-nested scheme
    pub fn single(scheme: Box<dyn PartitionSpaceBackend>) -> Self {
        DiskSchemes {
            inner: scheme,
            outer: None,
        }
    }

    /// Open a hybrid session: the inner scheme is read from the container
    /// partition of `outer` starting at `container_start`
    pub fn nested(
        mut outer: Box<dyn PartitionSpaceBackend>,
        container_start: Sectors,
        force_empty: bool,
    ) -> Result<Self> {
        let inner = outer
            .secondary_partitions(container_start, force_empty)
            .ok_or_else(|| {
                PlanError::rejected(
                    outer.scheme_name(),
                    format!("no nested scheme at sector {}", container_start),
                )
            })?;
        Ok(DiskSchemes {
            inner,
            outer: Some(outer),
        })
    }

    pub fn has_outer(&self) -> bool {
        self.outer.is_some()
    }

    /// Scheme owning entries of `owner`; falls back to the inner scheme when
    /// the session has no outer one
    pub fn scheme(&self, owner: SchemeOwner) -> &dyn PartitionSpaceBackend {
        match (owner, &self.outer) {
            (SchemeOwner::Outer, Some(outer)) => outer.as_ref(),
            _ => self.inner.as_ref(),
        }
    }

    pub fn scheme_mut(&mut self, owner: SchemeOwner) -> &mut dyn PartitionSpaceBackend {
        match (owner, &mut self.outer) {
            (SchemeOwner::Outer, Some(outer)) => outer.as_mut(),
            _ => self.inner.as_mut(),
        }
    }

    /// Physical id of the partition starting at `start` in `owner`'s table
    pub fn find_by_start(&self, owner: SchemeOwner, start: Sectors) -> Option<(PartId, DiskPartInfo)> {
        let scheme = self.scheme(owner);
        (0..scheme.num_part()).find_map(|id| {
            scheme
                .get_part_info(id)
                .filter(|info| info.start == start && !info.flags.scheme_internal)
                .map(|info| (id, info))
        })
    }

    /// Install region: the backend's guess, or the whole inner region
    pub fn install_target(&self) -> (Sectors, Sectors) {
        self.inner
            .guess_install_target()
            .unwrap_or((self.inner.disk_start(), self.inner.disk_size()))
    }
}

impl fmt::Debug for DiskSchemes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSchemes")
            .field("inner", &self.inner.scheme_name())
            .field("outer", &self.outer.as_ref().map(|o| o.scheme_name().to_string()))
            .finish()
    }
}

/// Bytes per MiB
pub const MEG: i64 = 1024 * 1024;

/// Sector size assumed when a device does not report one
pub const DEFAULT_SECTOR_SIZE: i64 = 512;

/// Convert MiB to sectors, saturating at the `Sectors` range
pub fn mib_to_sectors(mib: i64, sector_size: i64) -> Sectors {
    mib.saturating_mul(MEG / sector_size.max(1))
}

/// Convert sectors to whole MiB, rounding down
pub fn sectors_to_mib(sectors: Sectors, sector_size: i64) -> i64 {
    sectors / (MEG / sector_size.max(1))
}

/// Round `value` up to a multiple of `align`
pub fn roundup(value: Sectors, align: Sectors) -> Sectors {
    if align <= 1 {
        return value;
    }
    if value <= 0 {
        return (value / align) * align;
    }
    ((value + align - 1) / align) * align
}

/// Round `value` down to a multiple of `align`
pub fn rounddown(value: Sectors, align: Sectors) -> Sectors {
    if align <= 1 {
        return value;
    }
    value.div_euclid(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundup_and_rounddown() {
        assert_eq!(roundup(0, 2048), 0);
        assert_eq!(roundup(1, 2048), 2048);
        assert_eq!(roundup(2048, 2048), 2048);
        assert_eq!(roundup(2049, 2048), 4096);
        assert_eq!(roundup(-100, 2048), 0);
        assert_eq!(rounddown(4095, 2048), 2048);
        assert_eq!(rounddown(-1, 2048), -2048);
        assert_eq!(roundup(17, 1), 17);
    }

    #[test]
    fn unit_conversion() {
        assert_eq!(mib_to_sectors(1, 512), 2048);
        assert_eq!(mib_to_sectors(1, 4096), 256);
        assert_eq!(sectors_to_mib(4095, 512), 1);
        assert_eq!(mib_to_sectors(9_999_999_999_999_999, 512), Sectors::MAX);
    }

    #[test]
    fn fs_type_classification() {
        assert!(FsType::Tmpfs.is_ram_backed());
        assert!(!FsType::Ffs.is_ram_backed());
        assert!(!FsType::Swap.is_mountable());
        assert_eq!(FsType::Msdos.generic_type(), GenericPartType::Fat);
    }
}
