//! Default partition layout and sizing heuristics
//!
//! Builds the initial wanted set for a target region: a static template
//! sized for the machine's RAM, merged with whatever partitions already
//! exist, then adjusted so the suggestion fits the free space.

use crate::config::{LayoutTemplate, SwapSize};
use crate::disk::scheme::{
    mib_to_sectors, roundup, DiskPartInfo, DiskSchemes, FsType, GenericPartType, PartId,
    SchemeOwner, Sectors,
};
use crate::disk::usage::{PartitionUsageInfo, PartitionUsageSet, Placement};
use tracing::{debug, info};

/// Below this much RAM /tmp goes on disk instead of tmpfs
pub const SMALL_RAM_MIB: i64 = 160;

/// Below this much RAM swap is never shrunk to make room
pub const TINY_RAM_MIB: i64 = 32;

/// Extra space an X11 installation needs
pub const X11_SPACE_MIB: i64 = 300;

/// Share of RAM given to a tmpfs /tmp
pub const TMPFS_RAM_PERCENT: i64 = 25;

/// Machine facts the default layout depends on
#[derive(Debug, Clone, PartialEq)]
pub struct SystemFacts {
    pub ram_mib: i64,
    pub sector_size: i64,
    pub tmpfs_available: bool,
    pub x11_selected: bool,
    pub swap_allowed: bool,
    /// Highest sector the firmware can load the kernel from (0: no limit)
    pub root_limit: Sectors,
}

impl SystemFacts {
    fn sectors(&self, mib: i64) -> Sectors {
        mib_to_sectors(mib, self.sector_size)
    }

    fn ram_sectors(&self) -> Sectors {
        self.sectors(self.ram_mib)
    }
}

/// Turn the template into unmaterialized entries
fn template_entries(
    template: &LayoutTemplate,
    facts: &SystemFacts,
    has_outer: bool,
) -> Vec<PartitionUsageInfo> {
    let mut entries = Vec::new();

    for helper in &template.boot_helpers {
        let size = facts.sectors(helper.size_mib);
        let mut entry = PartitionUsageInfo::new(&helper.mount, helper.fs.generic_type(), helper.fs)
            .with_size(size)
            .with_def_size(size);
        entry.inst_flags.newfs = true;
        entry.inst_flags.mount = !helper.mount.is_empty();
        entry.inst_flags.boot = helper.bootable;
        if has_outer && matches!(helper.fs, FsType::Msdos | FsType::Ext2fs) {
            entry.placement = Placement::AddOuter;
        }
        entries.push(entry);
    }

    let root_size = facts.sectors(template.root_mib);
    let mut root = PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs)
        .with_size(root_size)
        .with_def_size(root_size);
    if template.root_extends {
        root = root.extending();
    }
    entries.push(root);

    let swap_size = match template.swap {
        _ if !facts.swap_allowed => None,
        SwapSize::None => None,
        SwapSize::Auto => Some(facts.ram_sectors()),
        SwapSize::Mib(mib) => Some(facts.sectors(mib)),
    };
    if let Some(size) = swap_size {
        entries.push(
            PartitionUsageInfo::new("", GenericPartType::Swap, FsType::Swap)
                .with_size(size)
                .with_def_size(size),
        );
    }

    if facts.tmpfs_available && facts.ram_mib >= SMALL_RAM_MIB {
        entries.push(
            PartitionUsageInfo::new("/tmp", GenericPartType::Root, FsType::Tmpfs)
                .with_size(-TMPFS_RAM_PERCENT),
        );
    } else {
        entries.push(
            PartitionUsageInfo::new("/tmp", GenericPartType::Root, FsType::Ffs)
                .with_def_size(facts.sectors(template.tmp_mib)),
        );
    }

    let usr_def = facts.sectors(template.usr_mib);
    entries.push(
        PartitionUsageInfo::new("/usr", GenericPartType::Root, FsType::Ffs)
            .with_size(if template.separate_usr { usr_def } else { 0 })
            .with_def_size(usr_def),
    );
    entries.push(
        PartitionUsageInfo::new("/var", GenericPartType::Root, FsType::Ffs)
            .with_def_size(facts.sectors(template.var_mib)),
    );

    entries
}

/// Attach an existing partition to the first matching template entry,
/// or append it as an entry of its own
fn merge_part_with_wanted(
    entries: &mut Vec<PartitionUsageInfo>,
    template_len: usize,
    owner: SchemeOwner,
    id: PartId,
    info: &DiskPartInfo,
    is_outer: bool,
) {
    let placement = if is_outer {
        Placement::Outer { add_inner: false }
    } else {
        Placement::Inner
    };

    let matched = entries[..template_len].iter_mut().find(|want| {
        !want.is_materialized()
            && !want.just_mountpoint()
            && want.generic_type == info.generic_type
            && (want.generic_type != GenericPartType::Root
                || info.mounted_on() == Some(want.mount.as_str()))
    });

    match matched {
        Some(want) => {
            debug!(
                "Existing partition {} at {} becomes {}",
                id,
                info.start,
                want.display_name()
            );
            want.cur_part_id = Some(id);
            want.owner = owner;
            want.size = info.size;
            want.cur_start = info.start;
            want.cur_flags = info.flags;
            want.placement = placement;
            // extend only applies to partitions still to be created
            let _ = want.set_extend(false);
            if info.fs_type != FsType::Unused {
                want.fs_type = info.fs_type;
                want.fs_version = info.fs_version;
            }
            if info.mounted_on().is_some() && want.fs_type.is_mountable() {
                want.inst_flags.mount = true;
            }
        }
        None => {
            debug!(
                "Existing partition {} at {} kept as-is ({})",
                id, info.start, info.generic_type
            );
            let mut entry = PartitionUsageInfo::from_part_info(owner, id, info);
            entry.placement = placement;
            entries.push(entry);
        }
    }
}

/// Build the wanted layout for `[start, start+size)`
pub fn fill_defaults(
    schemes: &DiskSchemes,
    start: Sectors,
    size: Sectors,
    reserved_space: Sectors,
    template: &LayoutTemplate,
    facts: &SystemFacts,
) -> PartitionUsageSet {
    let mut entries = template_entries(template, facts, schemes.has_outer());
    let template_len = entries.len();
    let position = |entries: &[PartitionUsageInfo], mount: &str| {
        entries[..template_len].iter().position(|e| e.mount == mount)
    };
    let root = position(&entries, "/");
    let mut usr = position(&entries, "/usr");
    let swap = entries[..template_len]
        .iter()
        .position(|e| e.generic_type == GenericPartType::Swap);

    // one foreign swap/FAT/ext2 partition of the parent scheme is enough
    if let Some(outer) = schemes.outer.as_deref() {
        let found = (0..outer.num_part()).find_map(|id| {
            outer.get_part_info(id).filter(|info| {
                !info.flags.scheme_internal
                    && !info.flags.sec_container
                    && matches!(
                        info.generic_type,
                        GenericPartType::Swap | GenericPartType::Fat | GenericPartType::Ext2
                    )
            })
            .map(|info| (id, info))
        });
        if let Some((id, info)) = found {
            merge_part_with_wanted(&mut entries, template_len, SchemeOwner::Outer, id, &info, true);
        }
    }

    let inner = schemes.inner.as_ref();
    for id in 0..inner.num_part() {
        let Some(info) = inner.get_part_info(id) else {
            continue;
        };
        if info.flags.scheme_internal {
            continue;
        }
        if info.generic_type != GenericPartType::Swap
            && (info.start < start || info.end() > start + size)
        {
            continue;
        }
        merge_part_with_wanted(&mut entries, template_len, SchemeOwner::Inner, id, &info, false);
    }

    let align = inner.part_alignment();

    if let Some(r) = root {
        if !entries[r].is_materialized() && facts.root_limit > 0 {
            entries[r].limit = facts.root_limit;
        }
    }
    let max_root = |entries: &[PartitionUsageInfo], r: usize| -> Option<Sectors> {
        (entries[r].limit > 0).then(|| entries[r].limit - start)
    };

    if facts.x11_selected {
        let xsize = facts.sectors(X11_SPACE_MIB);
        let usr_sized = usr.filter(|&u| entries[u].size > 0 && !entries[u].is_materialized());
        if let Some(u) = usr_sized {
            entries[u].size += xsize;
            entries[u].def_size += xsize;
        } else if let Some(r) = root.filter(|&r| !entries[r].is_materialized()) {
            entries[r].size += xsize;
            if let Some(max) = max_root(&entries, r) {
                if entries[r].size > max {
                    let spill = roundup(entries[r].size - max, align);
                    entries[r].size = max;
                    match usr.filter(|&u| !entries[u].is_materialized()) {
                        Some(u) => {
                            entries[u].size = entries[u].effective_size() + spill;
                            debug!("X11 space spills {} sectors into /usr", spill);
                        }
                        None => debug!("No /usr to take {} sectors of X11 space", spill),
                    }
                }
            }
        }
    }

    // how much is left if the suggestion is taken as-is
    let mut required = 0;
    if let Some(r) = root.filter(|&r| !entries[r].is_materialized()) {
        required += entries[r].size;
    }
    if let Some(u) = usr.filter(|&u| !entries[u].is_materialized()) {
        required += entries[u].effective_size();
    }
    let mut free_space = inner.free_space() - reserved_space - required;
    for (i, entry) in entries.iter().enumerate() {
        if Some(i) == root || Some(i) == usr {
            continue;
        }
        if entry.is_materialized() || entry.size <= 0 {
            continue;
        }
        if entry.is_outer() || entry.just_mountpoint() {
            continue;
        }
        free_space -= entry.size;
    }

    if free_space < 0 && facts.ram_mib > TINY_RAM_MIB {
        if let Some(s) = swap.filter(|&s| !entries[s].is_materialized()) {
            let old = entries[s].size;
            entries[s].size = (old + free_space).max(0);
            free_space += old - entries[s].size;
            info!(
                "Swap reduced to {} sectors to fit the disk",
                entries[s].size
            );
        }
    }

    if free_space > 0 {
        if let Some(r) = root.filter(|&r| !entries[r].is_materialized()) {
            let ram = facts.ram_sectors();
            let dump_space = if free_space > 2 * ram {
                2 * ram
            } else {
                ram.min(free_space)
            };
            entries[r].size += dump_space;
            free_space -= dump_space;
            debug!("Root gets {} sectors of crash dump space", dump_space);

            if let Some(max) = max_root(&entries, r) {
                let would_overflow = entries[r].extend() && entries[r].size + free_space > max;
                if entries[r].size > max || would_overflow {
                    match usr {
                        Some(u) if !entries[u].is_materialized() => {
                            let spill = roundup((entries[r].size - max).max(0), align);
                            entries[r].size = entries[r].size.min(max);
                            entries[u].size = entries[u].effective_size() + spill;
                            if entries[r].extend() {
                                let _ = entries[r].set_extend(false);
                                let _ = entries[u].set_extend(true);
                            }
                            debug!("Root limit moves {} sectors to /usr", spill);
                        }
                        _ => entries[r].size = entries[r].size.min(max),
                    }
                }
            }
        }
    }

    if let Some(r) = root {
        let root_size = entries[r].size;
        match usr {
            Some(u) => entries[u].def_size = root_size,
            None => entries[r].def_size = root_size,
        }
    }

    let mut set = PartitionUsageSet {
        entries,
        reserved_space,
        cur_free_space: 0,
    };
    set.recompute_free_space(schemes);
    info!(
        "Default layout: {} entries, {} sectors unassigned",
        set.entries.len(),
        set.cur_free_space
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootHelper;
    use crate::disk::memory::MemoryScheme;
    use crate::disk::scheme::{PartInfoFlags, PartitionSpaceBackend};

    const MB: i64 = 2048;

    fn facts(ram_mib: i64) -> SystemFacts {
        SystemFacts {
            ram_mib,
            sector_size: 512,
            tmpfs_available: true,
            x11_selected: false,
            swap_allowed: true,
            root_limit: 0,
        }
    }

    fn template() -> LayoutTemplate {
        LayoutTemplate {
            root_mib: 40,
            root_extends: false,
            usr_mib: 800,
            ..LayoutTemplate::default()
        }
    }

    fn empty_disk(mib: i64) -> DiskSchemes {
        DiskSchemes::single(Box::new(MemoryScheme::new("gpt", mib * MB, 1)))
    }

    fn entry<'a>(set: &'a PartitionUsageSet, mount: &str) -> &'a PartitionUsageInfo {
        &set.entries[set.find_mount(mount).unwrap()]
    }

    fn swap_entry(set: &PartitionUsageSet) -> &PartitionUsageInfo {
        set.entries
            .iter()
            .find(|e| e.generic_type == GenericPartType::Swap)
            .unwrap()
    }

    #[test]
    fn small_disk_scenario() {
        let schemes = empty_disk(2000);
        let set = fill_defaults(&schemes, 0, 2000 * MB, 0, &template(), &facts(512));

        assert_eq!(swap_entry(&set).size, 512 * MB);
        // 2000 - 40 - 800 - 512 leaves 648 MB: one RAM-sized dump fits
        assert_eq!(entry(&set, "/").size, (40 + 512) * MB);
        assert_eq!(set.extend_index(), None);
        assert!(set.cur_free_space > 0);
        assert_eq!(entry(&set, "/usr").def_size, entry(&set, "/").size);
        set.validate().unwrap();
    }

    #[test]
    fn large_disk_gets_two_dumps() {
        let schemes = empty_disk(100_000);
        let set = fill_defaults(&schemes, 0, 100_000 * MB, 0, &template(), &facts(1024));
        assert_eq!(entry(&set, "/").size, (40 + 2048) * MB);
    }

    #[test]
    fn tiny_disk_steals_from_swap() {
        let schemes = empty_disk(1000);
        let set = fill_defaults(&schemes, 0, 1000 * MB, 0, &template(), &facts(512));
        // 1000 - 40 - 800 = 160 MB left for swap
        assert_eq!(swap_entry(&set).size, 160 * MB);
        assert_eq!(entry(&set, "/").size, 40 * MB);
    }

    #[test]
    fn tmp_follows_ram_size() {
        let schemes = empty_disk(4000);
        let big = fill_defaults(&schemes, 0, 4000 * MB, 0, &template(), &facts(512));
        let tmp = entry(&big, "/tmp");
        assert_eq!(tmp.fs_type, FsType::Tmpfs);
        assert_eq!(tmp.size, -TMPFS_RAM_PERCENT);
        assert!(tmp.just_mountpoint());

        let small = fill_defaults(&schemes, 0, 4000 * MB, 0, &template(), &facts(64));
        let tmp = entry(&small, "/tmp");
        assert_eq!(tmp.fs_type, FsType::Ffs);
        assert_eq!(tmp.size, 0);
        assert!(tmp.def_size > 0);
    }

    #[test]
    fn swap_disabled() {
        let schemes = empty_disk(4000);
        let mut f = facts(512);
        f.swap_allowed = false;
        let set = fill_defaults(&schemes, 0, 4000 * MB, 0, &template(), &f);
        assert!(set
            .entries
            .iter()
            .all(|e| e.generic_type != GenericPartType::Swap));
    }

    #[test]
    fn existing_root_is_merged_in_place() {
        let mut disk = MemoryScheme::new("gpt", 4000 * MB, 1);
        disk.add_partition(&DiskPartInfo {
            start: MB,
            size: 300 * MB,
            generic_type: GenericPartType::Root,
            fs_type: FsType::Ffs,
            last_mounted: Some("/".to_string()),
            ..Default::default()
        })
        .unwrap();
        disk.add_partition(&DiskPartInfo {
            start: 400 * MB,
            size: 100 * MB,
            generic_type: GenericPartType::Root,
            fs_type: FsType::Ffs,
            last_mounted: Some("/home".to_string()),
            ..Default::default()
        })
        .unwrap();
        let schemes = DiskSchemes::single(Box::new(disk));
        let mut t = template();
        t.root_extends = true;
        let set = fill_defaults(&schemes, 0, 4000 * MB, 0, &t, &facts(512));

        let roots: Vec<&PartitionUsageInfo> =
            set.entries.iter().filter(|e| e.mount == "/").collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].cur_part_id, Some(0));
        assert_eq!(roots[0].size, 300 * MB);
        assert!(!roots[0].extend());
        assert!(roots[0].inst_flags.mount);

        let home = entry(&set, "/home");
        assert_eq!(home.cur_part_id, Some(1));
        assert_eq!(set.extend_index(), None);
    }

    #[test]
    fn partitions_outside_region_are_ignored_except_swap() {
        let mut disk = MemoryScheme::new("gpt", 4000 * MB, 1);
        disk.add_partition(&DiskPartInfo {
            start: MB,
            size: 100 * MB,
            generic_type: GenericPartType::Fat,
            fs_type: FsType::Msdos,
            ..Default::default()
        })
        .unwrap();
        disk.add_partition(&DiskPartInfo {
            start: 200 * MB,
            size: 100 * MB,
            generic_type: GenericPartType::Swap,
            fs_type: FsType::Swap,
            ..Default::default()
        })
        .unwrap();
        let schemes = DiskSchemes::single(Box::new(disk));
        let set = fill_defaults(&schemes, 1000 * MB, 3000 * MB, 0, &template(), &facts(512));

        assert!(set.entries.iter().all(|e| e.generic_type != GenericPartType::Fat));
        let swap = swap_entry(&set);
        assert_eq!(swap.cur_part_id, Some(1));
        assert_eq!(swap.size, 100 * MB);
    }

    #[test]
    fn root_limit_spills_into_usr() {
        let schemes = empty_disk(8000);
        let mut f = facts(1024);
        f.root_limit = 500 * MB;
        let mut t = template();
        t.root_extends = true;
        let set = fill_defaults(&schemes, 0, 8000 * MB, 0, &t, &f);

        let root = entry(&set, "/");
        assert_eq!(root.limit, 500 * MB);
        assert_eq!(root.size, 500 * MB);
        assert!(!root.extend());
        let usr = entry(&set, "/usr");
        assert!(usr.extend());
        // 40 + 2048 dump space, of which 460 fit below the limit
        assert_eq!(usr.size, 800 * MB + (40 + 2048 - 500) * MB);
        set.validate().unwrap();
    }

    #[test]
    fn x11_space_past_root_limit_spills_into_usr() {
        let schemes = empty_disk(8000);
        let mut f = facts(512);
        f.x11_selected = true;
        f.root_limit = 200 * MB;
        let set = fill_defaults(&schemes, 0, 8000 * MB, 0, &template(), &f);

        // 40 + 300 overflows the limit by 140, then the dump space follows
        let root = entry(&set, "/");
        assert_eq!(root.size, 200 * MB);
        let usr = entry(&set, "/usr");
        assert_eq!(usr.size, (800 + 140 + 1024) * MB);
        assert_eq!(usr.def_size, 200 * MB);
        set.validate().unwrap();
    }

    #[test]
    fn extend_moves_to_usr_before_root_reaches_limit() {
        let schemes = empty_disk(8000);
        let mut f = facts(512);
        f.root_limit = 2000 * MB;
        let mut t = template();
        t.root_extends = true;
        let set = fill_defaults(&schemes, 0, 8000 * MB, 0, &t, &f);

        // 40 + 1024 stays below the limit, the leftover space would not
        let root = entry(&set, "/");
        assert_eq!(root.size, (40 + 1024) * MB);
        assert!(!root.extend());
        let usr = entry(&set, "/usr");
        assert!(usr.extend());
        assert_eq!(usr.size, 800 * MB);
        assert_eq!(usr.def_size, root.size);
        set.validate().unwrap();
    }

    #[test]
    fn x11_space_goes_to_sized_usr() {
        let schemes = empty_disk(8000);
        let mut f = facts(512);
        f.x11_selected = true;
        let mut t = template();
        t.separate_usr = true;
        let set = fill_defaults(&schemes, 0, 8000 * MB, 0, &t, &f);
        assert_eq!(entry(&set, "/usr").size, (800 + X11_SPACE_MIB) * MB);

        t.separate_usr = false;
        let set = fill_defaults(&schemes, 0, 8000 * MB, 0, &t, &f);
        assert_eq!(entry(&set, "/usr").size, 0);
        assert_eq!(entry(&set, "/").size, (40 + X11_SPACE_MIB + 1024) * MB);
    }

    #[test]
    fn outer_swap_merged_once() {
        let mut mbr = MemoryScheme::new("mbr", 8000 * MB, MB);
        for (start, ty, fs) in [
            (MB, GenericPartType::Fat, FsType::Msdos),
            (200 * MB, GenericPartType::Swap, FsType::Swap),
        ] {
            mbr.add_partition(&DiskPartInfo {
                start,
                size: 100 * MB,
                generic_type: ty,
                fs_type: fs,
                ..Default::default()
            })
            .unwrap();
        }
        mbr.add_partition(&DiskPartInfo {
            start: 1000 * MB,
            size: 7000 * MB,
            generic_type: GenericPartType::SecondaryContainer,
            flags: PartInfoFlags {
                sec_container: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let schemes = DiskSchemes::nested(Box::new(mbr), 1000 * MB, true).unwrap();
        let (start, size) = schemes.install_target();
        let set = fill_defaults(&schemes, start, size, 0, &template(), &facts(512));

        let outer: Vec<&PartitionUsageInfo> = set.entries.iter().filter(|e| e.is_outer()).collect();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].generic_type, GenericPartType::Fat);
        assert_eq!(outer[0].owner, SchemeOwner::Outer);
        assert_eq!(outer[0].placement, Placement::Outer { add_inner: false });
        assert_eq!(schemes.inner.free_space(), 7000 * MB);
    }

    #[test]
    fn fat_boot_helper_goes_outer_on_hybrid_disks() {
        let mut t = template();
        t.boot_helpers = vec![BootHelper {
            size_mib: 64,
            fs: FsType::Msdos,
            mount: "/boot".to_string(),
            bootable: true,
        }];
        let entries = template_entries(&t, &facts(512), true);
        assert_eq!(entries[0].placement, Placement::AddOuter);
        assert_eq!(entries[1].mount, "/");
        let entries = template_entries(&t, &facts(512), false);
        assert_eq!(entries[0].placement, Placement::Inner);
    }
}
