//! Keeping wanted entries in step with the physical partition table
//!
//! Backends renumber partitions whenever the table changes, so ids cached
//! in a [`PartitionUsageSet`] go stale after every add or delete. The
//! functions here re-derive them from what is actually on the table,
//! matching entries by start sector.

use crate::disk::scheme::{
    DiskPartInfo, DiskSchemes, PartId, PartitionSpaceBackend, SchemeOwner, Sectors,
};
use crate::disk::usage::{PartitionUsageInfo, PartitionUsageSet, Placement};
use tracing::debug;

/// Find the unclaimed partition starting at `start` with the same
/// internal/user classification
fn locate(
    scheme: &dyn PartitionSpaceBackend,
    start: Sectors,
    internal: bool,
    claimed: &[bool],
) -> Option<(PartId, DiskPartInfo)> {
    (0..scheme.num_part()).find_map(|id| {
        if claimed.get(id).copied().unwrap_or(false) {
            return None;
        }
        scheme
            .get_part_info(id)
            .filter(|info| info.start == start && info.flags.scheme_internal == internal)
            .map(|info| (id, info))
    })
}

/// Re-resolve every materialized entry's id from its cached start sector
///
/// Entries whose partition is gone lose their id.
pub fn relink_by_start(set: &mut PartitionUsageSet, schemes: &DiskSchemes) {
    let mut claimed_inner = vec![false; schemes.inner.num_part()];
    let mut claimed_outer = vec![false; schemes.outer.as_ref().map_or(0, |o| o.num_part())];

    for entry in set.entries.iter_mut() {
        if entry.cur_part_id.is_none() {
            continue;
        }
        let owner = if schemes.has_outer() {
            entry.owner
        } else {
            SchemeOwner::Inner
        };
        let claimed = match owner {
            SchemeOwner::Inner => &mut claimed_inner,
            SchemeOwner::Outer => &mut claimed_outer,
        };
        let scheme = schemes.scheme(owner);
        match locate(scheme, entry.cur_start, entry.cur_flags.scheme_internal, claimed.as_slice()) {
            Some((id, info)) => {
                claimed[id] = true;
                entry.cur_part_id = Some(id);
                entry.cur_flags = info.flags;
            }
            None => {
                debug!(
                    "{} no longer has a partition at sector {}",
                    entry.display_name(),
                    entry.cur_start
                );
                entry.cur_part_id = None;
            }
        }
    }
}

/// Rebuild `set` so that `entries[i]` is physical partition `i` of the
/// inner scheme, followed by the wanted entries not created yet
///
/// Running it twice without a table mutation in between changes nothing.
pub fn sort_and_sync_parts(set: &mut PartitionUsageSet, schemes: &DiskSchemes) {
    let inner = schemes.inner.as_ref();
    let num = inner.num_part();
    let mut slots: Vec<Option<PartitionUsageInfo>> = vec![None; num];
    let mut claimed = vec![false; num];
    let mut pending = Vec::new();

    for mut entry in set.entries.drain(..) {
        if entry.cur_part_id.is_none() {
            if entry.size != 0 {
                pending.push(entry);
            }
            continue;
        }
        if entry.just_mountpoint()
            || entry.placement == (Placement::Outer { add_inner: false })
            || (entry.owner == SchemeOwner::Outer && schemes.has_outer())
        {
            continue;
        }
        match locate(inner, entry.cur_start, entry.cur_flags.scheme_internal, &claimed) {
            Some((id, info)) => {
                claimed[id] = true;
                entry.cur_part_id = Some(id);
                entry.cur_flags = info.flags;
                entry.size = info.size;
                entry.owner = SchemeOwner::Inner;
                slots[id] = Some(entry);
            }
            None => {
                debug!(
                    "{} lost its partition, back to wanted entries",
                    entry.display_name()
                );
                entry.cur_part_id = None;
                if entry.size != 0 {
                    pending.push(entry);
                }
            }
        }
    }

    let mut entries: Vec<PartitionUsageInfo> = slots
        .into_iter()
        .enumerate()
        .map(|(id, slot)| {
            slot.unwrap_or_else(|| match inner.get_part_info(id) {
                Some(info) => PartitionUsageInfo::from_part_info(SchemeOwner::Inner, id, &info),
                None => {
                    let mut placeholder = PartitionUsageInfo::default();
                    placeholder.cur_flags.scheme_internal = true;
                    placeholder
                }
            })
        })
        .collect();
    entries.extend(pending);

    set.entries = entries;
    set.cur_free_space = inner.free_space() - set.reserved_space;
}
