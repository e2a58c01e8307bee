//! In-memory partitioning scheme
//!
//! Keeps a partition table as a sorted list of descriptors. Ids are
//! positions in that list, so every add or delete renumbers the
//! partitions behind it, the same way a real disklabel or MBR backend
//! invalidates ids on mutation. Used for dry-run planning and tests.

use crate::disk::scheme::{
    roundup, DiskPartInfo, FreeSpace, GenericPartType, PartId, PartitionSpaceBackend, Sectors,
};
use crate::utils::error::{PlanError, Result};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MemoryScheme {
    name: String,
    /// Size of the whole device; outer partitions may live anywhere on it
    whole_disk: Sectors,
    start: Sectors,
    size: Sectors,
    alignment: Sectors,
    parts: Vec<DiskPartInfo>,
    /// Nested tables, keyed by the start of their container partition
    nested: Vec<(Sectors, MemoryScheme)>,
    /// Name and alignment of nested schemes created from scratch
    nested_name: String,
    nested_alignment: Sectors,
    allow_outer: bool,
}

impl MemoryScheme {
    /// An empty scheme managing the whole device
    pub fn new(name: &str, disk_sectors: Sectors, alignment: Sectors) -> Self {
        MemoryScheme {
            name: name.to_string(),
            whole_disk: disk_sectors,
            start: 0,
            size: disk_sectors,
            alignment: alignment.max(1),
            parts: Vec::new(),
            nested: Vec::new(),
            nested_name: "disklabel".to_string(),
            nested_alignment: alignment.max(1),
            allow_outer: false,
        }
    }

    /// Restrict the managed region to `[start, start+size)`
    pub fn with_region(mut self, start: Sectors, size: Sectors) -> Self {
        self.start = start;
        self.size = size;
        self
    }

    /// Accept partitions mirrored from a parent scheme, even outside the
    /// managed region
    pub fn with_outer_partitions(mut self, allow: bool) -> Self {
        self.allow_outer = allow;
        self
    }

    /// Scheme type and alignment used for nested tables created on demand
    pub fn with_nested_defaults(mut self, name: &str, alignment: Sectors) -> Self {
        self.nested_name = name.to_string();
        self.nested_alignment = alignment.max(1);
        self
    }

    /// Pre-existing nested table inside the container starting at `start`
    pub fn with_nested(mut self, start: Sectors, scheme: MemoryScheme) -> Self {
        self.nested.retain(|(s, _)| *s != start);
        self.nested.push((start, scheme));
        self
    }

    pub fn partitions(&self) -> &[DiskPartInfo] {
        &self.parts
    }

    fn region_end(&self) -> Sectors {
        self.start + self.size
    }

    /// Bounds a partition must stay within
    fn bounds_for(&self, info: &DiskPartInfo, outer: bool) -> (Sectors, Sectors) {
        let inside = info.start >= self.start && info.end() <= self.region_end();
        if outer && self.allow_outer && !inside {
            (0, self.whole_disk)
        } else {
            (self.start, self.region_end())
        }
    }

    fn check_placement(&self, info: &DiskPartInfo, ignore: Option<PartId>, outer: bool) -> Result<()> {
        if info.size <= 0 {
            return Err(PlanError::rejected(&self.name, "partition size must be positive"));
        }
        let (lo, hi) = self.bounds_for(info, outer);
        if info.start < lo || info.end() > hi {
            return Err(PlanError::rejected(
                &self.name,
                format!(
                    "partition {}+{} outside of usable range {}..{}",
                    info.start, info.size, lo, hi
                ),
            ));
        }
        if info.flags.scheme_internal {
            return Ok(());
        }
        let clash = self.parts.iter().enumerate().find(|(id, p)| {
            Some(*id) != ignore
                && !p.flags.scheme_internal
                && info.start < p.end()
                && info.end() > p.start
        });
        if let Some((id, p)) = clash {
            return Err(PlanError::rejected(
                &self.name,
                format!(
                    "partition {}+{} overlaps partition {} at {}+{}",
                    info.start, info.size, id, p.start, p.size
                ),
            ));
        }
        Ok(())
    }

    fn insert_sorted(&mut self, info: DiskPartInfo) -> PartId {
        let pos = self
            .parts
            .iter()
            .position(|p| p.start > info.start)
            .unwrap_or(self.parts.len());
        self.parts.insert(pos, info);
        pos
    }

    fn occupied(&self) -> impl Iterator<Item = &DiskPartInfo> {
        self.parts.iter().filter(|p| !p.flags.scheme_internal)
    }
}

impl PartitionSpaceBackend for MemoryScheme {
    fn scheme_name(&self) -> &str {
        &self.name
    }

    fn disk_start(&self) -> Sectors {
        self.start
    }

    fn disk_size(&self) -> Sectors {
        self.size
    }

    fn free_space(&self) -> Sectors {
        let used: Sectors = self
            .occupied()
            .map(|p| {
                let lo = p.start.max(self.start);
                let hi = p.end().min(self.region_end());
                (hi - lo).max(0)
            })
            .sum();
        self.size - used
    }

    fn num_part(&self) -> usize {
        self.parts.len()
    }

    fn part_alignment(&self) -> Sectors {
        self.alignment
    }

    fn get_part_info(&self, id: PartId) -> Option<DiskPartInfo> {
        self.parts.get(id).cloned()
    }

    fn set_part_info(&mut self, id: PartId, info: &DiskPartInfo) -> Result<()> {
        if id >= self.parts.len() {
            return Err(PlanError::NoSuchPartition(id));
        }
        self.check_placement(info, Some(id), true)?;
        debug!(
            "{}: partition {} now {}+{}",
            self.name, id, info.start, info.size
        );
        self.parts.remove(id);
        self.insert_sorted(info.clone());
        Ok(())
    }

    fn add_partition(&mut self, info: &DiskPartInfo) -> Result<PartId> {
        self.check_placement(info, None, false)?;
        debug!("{}: adding partition at {}+{}", self.name, info.start, info.size);
        Ok(self.insert_sorted(info.clone()))
    }

    fn supports_outer_partitions(&self) -> bool {
        self.allow_outer
    }

    fn add_outer_partition(&mut self, info: &DiskPartInfo) -> Result<PartId> {
        self.check_placement(info, None, true)?;
        debug!(
            "{}: mirroring outer partition at {}+{}",
            self.name, info.start, info.size
        );
        Ok(self.insert_sorted(info.clone()))
    }

    fn delete_partition(&mut self, id: PartId) -> Result<()> {
        if id >= self.parts.len() {
            return Err(PlanError::NoSuchPartition(id));
        }
        let removed = self.parts.remove(id);
        self.nested.retain(|(s, _)| *s != removed.start);
        debug!(
            "{}: deleted partition {} at {}+{}",
            self.name, id, removed.start, removed.size
        );
        Ok(())
    }

    fn delete_all_partitions(&mut self) -> Result<()> {
        self.parts.retain(|p| p.flags.scheme_internal);
        self.nested.clear();
        Ok(())
    }

    fn get_free_spaces(
        &self,
        max: usize,
        min_size: Sectors,
        align: Sectors,
        from: Sectors,
        to: Option<Sectors>,
    ) -> Vec<FreeSpace> {
        let min_size = min_size.max(1);
        let end = to.map_or(self.region_end(), |t| t.min(self.region_end()));
        let mut result = Vec::new();
        let mut cursor = from.max(self.start);

        let push_gap = |gap_start: Sectors, gap_end: Sectors, result: &mut Vec<FreeSpace>| {
            let start = roundup(gap_start, align);
            let size = gap_end.min(end) - start;
            if size >= min_size && result.len() < max {
                result.push(FreeSpace { start, size });
            }
        };

        let mut occupied: Vec<&DiskPartInfo> = self.occupied().collect();
        occupied.sort_by_key(|p| p.start);
        for p in occupied {
            if cursor >= end || result.len() >= max {
                break;
            }
            if p.end() <= cursor {
                continue;
            }
            if p.start > cursor {
                push_gap(cursor, p.start, &mut result);
            }
            cursor = cursor.max(p.end());
        }
        if cursor < end && result.len() < max {
            push_gap(cursor, end, &mut result);
        }
        result
    }

    fn max_free_space_at(&self, start: Sectors) -> Sectors {
        if start < self.start || start >= self.region_end() {
            return 0;
        }
        let mut limit = self.region_end();
        for p in self.occupied() {
            if p.start == start {
                continue;
            }
            if p.start < start && p.end() > start {
                return 0;
            }
            if p.start > start {
                limit = limit.min(p.start);
            }
        }
        limit - start
    }

    fn secondary_partitions(
        &mut self,
        start: Sectors,
        force_empty: bool,
    ) -> Option<Box<dyn PartitionSpaceBackend>> {
        let container = self
            .parts
            .iter()
            .find(|p| {
                p.start == start
                    && (p.flags.sec_container
                        || p.generic_type == GenericPartType::SecondaryContainer)
            })?
            .clone();

        if !force_empty {
            if let Some((_, scheme)) = self.nested.iter().find(|(s, _)| *s == start) {
                return Some(Box::new(scheme.clone()));
            }
        }
        let inner = MemoryScheme::new(&self.nested_name, self.whole_disk, self.nested_alignment)
            .with_region(container.start, container.size)
            .with_outer_partitions(true);
        Some(Box::new(inner))
    }

    fn guess_install_target(&self) -> Option<(Sectors, Sectors)> {
        self.parts
            .iter()
            .find(|p| p.flags.install_target || p.flags.sec_container)
            .map(|p| (p.start, p.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::scheme::{FsType, PartInfoFlags};

    fn part(start: Sectors, size: Sectors) -> DiskPartInfo {
        DiskPartInfo {
            start,
            size,
            generic_type: GenericPartType::Root,
            fs_type: FsType::Ffs,
            ..Default::default()
        }
    }

    #[test]
    fn ids_follow_start_order() {
        let mut disk = MemoryScheme::new("gpt", 100_000, 64);
        assert_eq!(disk.add_partition(&part(50_000, 1000)).unwrap(), 0);
        assert_eq!(disk.add_partition(&part(1000, 1000)).unwrap(), 0);
        assert_eq!(disk.get_part_info(1).unwrap().start, 50_000);
        assert_eq!(disk.free_space(), 98_000);
    }

    #[test]
    fn overlap_is_rejected() {
        let mut disk = MemoryScheme::new("gpt", 100_000, 64);
        disk.add_partition(&part(1000, 1000)).unwrap();
        assert!(disk.add_partition(&part(1500, 1000)).is_err());
        assert!(disk.add_partition(&part(99_500, 1000)).is_err());
        assert_eq!(disk.num_part(), 1);
    }

    #[test]
    fn free_spaces_are_aligned_and_ordered() {
        let mut disk = MemoryScheme::new("gpt", 100_000, 64);
        disk.add_partition(&part(1000, 1000)).unwrap();
        let spaces = disk.get_free_spaces(4, 100, 64, 0, None);
        assert_eq!(spaces[0], FreeSpace { start: 0, size: 1000 });
        assert_eq!(spaces[1].start, 2048);
        assert_eq!(spaces[1].size, 100_000 - 2048);

        let later = disk.get_free_spaces(1, 100, 64, 500, None);
        assert_eq!(later[0].start, 512);
        assert_eq!(later[0].size, 488);
    }

    #[test]
    fn max_free_space_ignores_partition_at_start() {
        let mut disk = MemoryScheme::new("gpt", 100_000, 64);
        disk.add_partition(&part(1000, 1000)).unwrap();
        disk.add_partition(&part(10_000, 1000)).unwrap();
        assert_eq!(disk.max_free_space_at(1000), 9000);
        assert_eq!(disk.max_free_space_at(1500), 0);
        assert_eq!(disk.max_free_space_at(11_000), 89_000);
    }

    #[test]
    fn nested_scheme_covers_container() {
        let mut mbr = MemoryScheme::new("mbr", 200_000, 2048);
        mbr.add_partition(&DiskPartInfo {
            start: 2048,
            size: 100_000,
            generic_type: GenericPartType::SecondaryContainer,
            flags: PartInfoFlags {
                sec_container: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let inner = mbr.secondary_partitions(2048, false).unwrap();
        assert_eq!(inner.disk_start(), 2048);
        assert_eq!(inner.disk_size(), 100_000);
        assert!(inner.supports_outer_partitions());
        assert!(mbr.secondary_partitions(4096, false).is_none());
        assert_eq!(mbr.guess_install_target(), Some((2048, 100_000)));
    }

    #[test]
    fn internal_partitions_do_not_consume_space() {
        let mut disk = MemoryScheme::new("disklabel", 10_000, 1);
        let mut raw = part(0, 10_000);
        raw.flags.scheme_internal = true;
        disk.add_partition(&raw).unwrap();
        disk.add_partition(&part(0, 500)).unwrap();
        assert_eq!(disk.free_space(), 9500);
        disk.delete_all_partitions().unwrap();
        assert_eq!(disk.num_part(), 1);
    }

    #[test]
    fn delete_in_range_keeps_outside_partitions() {
        let mut disk = MemoryScheme::new("gpt", 100_000, 1);
        disk.add_partition(&part(100, 100)).unwrap();
        disk.add_partition(&part(1000, 100)).unwrap();
        disk.add_partition(&part(5000, 100)).unwrap();
        disk.delete_partitions_in_range(900, 1000).unwrap();
        let starts: Vec<Sectors> = disk.partitions().iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![100, 5000]);
    }
}
