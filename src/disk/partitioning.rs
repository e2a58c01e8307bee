//! Turning a wanted layout into real partitions
//!
//! [`apply_settings_to_partitions`] runs in two passes: first every entry
//! gets its final size (the extend entry absorbs what is left), then the
//! entries are placed in free space in array order. Outer-scheme partitions
//! are created before inner ones and mirrored into the inner scheme last.

use crate::disk::scheme::{
    rounddown, roundup, DiskPartInfo, DiskSchemes, PartitionSpaceBackend, SchemeOwner, Sectors,
};
use crate::disk::sync::{relink_by_start, sort_and_sync_parts};
use crate::disk::usage::{PartitionUsageInfo, PartitionUsageSet, Placement};
use crate::utils::error::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What one allocator run did, by entry display name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationReport {
    /// Newly created partitions
    pub placed: Vec<String>,
    /// Existing partitions whose size changed
    pub resized: Vec<String>,
    /// Wanted entries left without a partition
    pub unplaced: Vec<String>,
}

impl AllocationReport {
    pub fn is_complete(&self) -> bool {
        self.unplaced.is_empty()
    }
}

/// Physical size of a materialized entry, 0 otherwise
fn current_size(entry: &PartitionUsageInfo, schemes: &DiskSchemes) -> Sectors {
    entry
        .cur_part_id
        .and_then(|id| schemes.scheme(entry.owner).get_part_info(id))
        .map_or(0, |info| info.size)
}

/// First free range of at least `want` sectors, or of `want - 2*align`
/// when nothing that large is left
fn find_space(
    scheme: &dyn PartitionSpaceBackend,
    want: Sectors,
    align: Sectors,
    from: Sectors,
    to: Option<Sectors>,
) -> Option<(Sectors, Sectors)> {
    let first = scheme.get_free_spaces(1, want, align, from, to);
    let found = match first.first() {
        Some(space) => Some(*space),
        None if want > 2 * align => scheme
            .get_free_spaces(1, want - 2 * align, align, from, to)
            .first()
            .copied(),
        None => None,
    }?;
    let size = want.min(rounddown(found.size, align));
    (size > 0).then_some((found.start, size))
}

/// Step 1: final size of the extend entry
fn size_extend_entry(set: &mut PartitionUsageSet, schemes: &DiskSchemes, start: Sectors) {
    let inner = schemes.inner.as_ref();
    let align = inner.part_alignment();
    let free = inner.free_space();

    let mut planned_space = if free > 0 { align } else { 0 };
    for entry in &set.entries {
        if !entry.counts_against_free_space() {
            continue;
        }
        let grow = entry.size - current_size(entry, schemes);
        planned_space += roundup(grow.max(0), align);
    }

    let Some(idx) = set.extend_index() else {
        return;
    };
    let remainder = free - set.reserved_space - planned_space;
    let entry = &mut set.entries[idx];
    if remainder > 0 {
        entry.size += roundup(remainder, align);
    }
    if entry.limit > 0 {
        let predicted_start = if entry.is_materialized() {
            entry.cur_start
        } else {
            roundup(start, align)
        };
        if predicted_start + entry.size > entry.limit {
            entry.size = entry.limit - predicted_start;
        }
    }
    debug!(
        "{} extends to {} sectors ({} planned)",
        entry.display_name(),
        entry.size,
        planned_space
    );
}

/// Step 2: grow or shrink existing partitions in place
fn resize_existing(
    set: &mut PartitionUsageSet,
    schemes: &mut DiskSchemes,
    report: &mut AllocationReport,
) {
    for entry in set.entries.iter_mut() {
        let Some(id) = entry.cur_part_id else {
            continue;
        };
        if !entry.counts_against_free_space() || entry.size <= 0 {
            continue;
        }
        let scheme = schemes.scheme_mut(entry.owner);
        let Some(mut info) = scheme.get_part_info(id) else {
            continue;
        };
        let wanted = roundup(entry.size, scheme.part_alignment());
        if wanted == info.size {
            continue;
        }
        if wanted > scheme.max_free_space_at(info.start) {
            debug!(
                "No room to grow {} to {} sectors, keeping {}",
                entry.display_name(),
                wanted,
                info.size
            );
            continue;
        }
        info.size = wanted;
        match scheme.set_part_info(id, &info) {
            Ok(()) => {
                entry.size = wanted;
                report.resized.push(entry.display_name());
            }
            Err(e) => warn!("Resizing {} failed: {}", entry.display_name(), e),
        }
    }
}

/// Step 3: create `AddOuter` entries in the outer scheme; returns the end
/// of the last one created inside the target region
fn place_outer(
    set: &mut PartitionUsageSet,
    schemes: &mut DiskSchemes,
    start: Sectors,
    size: Sectors,
    report: &mut AllocationReport,
) -> Option<Sectors> {
    let outer = schemes.outer.as_deref_mut()?;
    let align = outer.part_alignment();
    let mut cursor = start;
    let mut inside_end = None;

    for entry in set.entries.iter_mut() {
        if entry.placement != Placement::AddOuter || entry.is_materialized() || entry.size <= 0 {
            continue;
        }
        let want = roundup(entry.size, align);
        let Some((part_start, part_size)) = find_space(outer, want, align, cursor, None) else {
            info!("No room in {} for {}", outer.scheme_name(), entry.display_name());
            report.unplaced.push(entry.display_name());
            continue;
        };
        match outer.add_partition(&entry.to_part_info(part_start, part_size)) {
            Ok(id) => {
                entry.placement = Placement::Outer { add_inner: true };
                entry.owner = SchemeOwner::Outer;
                entry.cur_part_id = Some(id);
                entry.cur_start = part_start;
                entry.size = part_size;
                entry.mark_new_filesystem();
                cursor = roundup(part_start + part_size, align);
                if part_start >= start && part_start < start + size {
                    inside_end = Some(cursor);
                }
                report.placed.push(entry.display_name());
            }
            Err(e) => {
                warn!("{}: {}", entry.display_name(), e);
                report.unplaced.push(entry.display_name());
            }
        }
    }
    inside_end
}

/// Clone target descriptor in the inner scheme's terms
fn clone_part_info(entry: &PartitionUsageInfo, inner: &dyn PartitionSpaceBackend) -> Option<DiskPartInfo> {
    let selection = entry.clone.as_ref()?;
    let source = selection.selected()?;
    let mut info = inner.adapt_foreign_part_info(&selection.source.scheme, source)?;
    info.last_mounted = (!entry.mount.is_empty()).then(|| entry.mount.clone());
    Some(info)
}

/// Step 4: create the remaining entries in the inner scheme
fn place_inner(
    set: &mut PartitionUsageSet,
    schemes: &mut DiskSchemes,
    start: Sectors,
    size: Sectors,
    mut cursor: Sectors,
    report: &mut AllocationReport,
) {
    let has_outer = schemes.has_outer();
    let inner = schemes.inner.as_mut();
    let align = inner.part_alignment();
    let end = start + size;

    for entry in set.entries.iter_mut() {
        if entry.is_materialized() || entry.just_mountpoint() || entry.is_outer() {
            continue;
        }
        if has_outer && entry.placement == Placement::AddOuter {
            continue;
        }
        if entry.size <= 0 {
            // the limit clamp can leave the extend entry nothing
            if entry.extend() {
                report.unplaced.push(entry.display_name());
            }
            continue;
        }
        if cursor >= end {
            report.unplaced.push(entry.display_name());
            continue;
        }

        let clone_info = if entry.clone.is_some() {
            match clone_part_info(entry, inner) {
                Some(info) => Some(info),
                None => {
                    warn!("Cannot clone into {}: source not usable", entry.display_name());
                    report.unplaced.push(entry.display_name());
                    continue;
                }
            }
        } else {
            None
        };
        let want = roundup(clone_info.as_ref().map_or(entry.size, |i| i.size), align);

        let Some((part_start, mut part_size)) = find_space(inner, want, align, cursor, Some(end))
        else {
            info!("No free space left for {}", entry.display_name());
            report.unplaced.push(entry.display_name());
            continue;
        };
        if entry.limit > 0 {
            part_size = part_size.min(rounddown(entry.limit - part_start, align));
        }
        if part_size <= 0 {
            report.unplaced.push(entry.display_name());
            continue;
        }

        let info = match &clone_info {
            Some(source) => DiskPartInfo {
                start: part_start,
                size: part_size,
                ..source.clone()
            },
            None => entry.to_part_info(part_start, part_size),
        };
        match inner.add_partition(&info) {
            Ok(id) => {
                entry.cur_part_id = Some(id);
                entry.cur_start = part_start;
                entry.cur_flags = info.flags;
                entry.size = part_size;
                entry.owner = SchemeOwner::Inner;
                if clone_info.is_some() {
                    entry.generic_type = info.generic_type;
                    entry.fs_type = info.fs_type;
                    entry.fs_version = info.fs_version;
                    entry.inst_flags.mount = !entry.mount.is_empty();
                } else {
                    entry.mark_new_filesystem();
                }
                cursor = roundup(part_start + part_size, align);
                report.placed.push(entry.display_name());
            }
            Err(e) => {
                warn!("{}: {}", entry.display_name(), e);
                report.unplaced.push(entry.display_name());
            }
        }
    }
}

/// Step 5: give every new outer partition its inner twin
fn mirror_outer(set: &mut PartitionUsageSet, schemes: &mut DiskSchemes) {
    let inner = schemes.inner.as_mut();
    for entry in set.entries.iter_mut() {
        if entry.placement != (Placement::Outer { add_inner: true }) || entry.size <= 0 {
            continue;
        }
        let twin = (0..inner.num_part()).find_map(|id| {
            inner
                .get_part_info(id)
                .filter(|p| p.start == entry.cur_start && p.size == entry.size)
                .map(|_| id)
        });
        if let Some(id) = twin {
            entry.owner = SchemeOwner::Inner;
            entry.cur_part_id = Some(id);
            continue;
        }
        let info = entry.to_part_info(entry.cur_start, entry.size);
        let added = if inner.supports_outer_partitions() {
            inner.add_outer_partition(&info)
        } else {
            inner.add_partition(&info)
        };
        match added {
            Ok(id) => {
                debug!(
                    "Mirrored {} into {} at {}",
                    entry.display_name(),
                    inner.scheme_name(),
                    entry.cur_start
                );
                entry.owner = SchemeOwner::Inner;
                entry.cur_part_id = Some(id);
                entry.cur_flags = info.flags;
                entry.mark_new_filesystem();
            }
            Err(e) => warn!("Mirroring {} failed: {}", entry.display_name(), e),
        }
    }
}

/// Create, resize and mirror partitions until the backends match `set`
///
/// Placement failures are not errors: the entry stays unmaterialized and
/// shows up in [`AllocationReport::unplaced`].
pub fn apply_settings_to_partitions(
    set: &mut PartitionUsageSet,
    schemes: &mut DiskSchemes,
    start: Sectors,
    size: Sectors,
) -> Result<AllocationReport> {
    set.validate()?;
    info!(
        "Allocating {} entries in {} ({}+{})",
        set.entries.len(),
        schemes.inner.scheme_name(),
        start,
        size
    );
    let mut report = AllocationReport::default();

    size_extend_entry(set, schemes, start);
    resize_existing(set, schemes, &mut report);

    let align = schemes.inner.part_alignment();
    let cursor = match place_outer(set, schemes, start, size, &mut report) {
        Some(end) => roundup(end.max(start), align),
        None => start,
    };
    place_inner(set, schemes, start, size, cursor, &mut report);
    mirror_outer(set, schemes);

    relink_by_start(set, schemes);
    sort_and_sync_parts(set, schemes);

    if report.is_complete() {
        info!("Placed {} partitions", report.placed.len());
    } else {
        warn!(
            "Placed {} partitions, no room for: {}",
            report.placed.len(),
            report.unplaced.join(", ")
        );
    }
    Ok(report)
}
