//! Expanding multi-source clone requests
//!
//! The user may ask for several existing partitions to be cloned in one
//! go. Before allocation every such request is split into one entry per
//! source, each sized like the partition it copies.

use crate::disk::usage::{CloneSelection, PartitionUsageInfo, PartitionUsageSet};
use std::rc::Rc;
use tracing::{debug, warn};

/// Expand every unmaterialized clone entry into one entry per source
///
/// Entries already backed by a partition are left alone: cloning only
/// matters when a partition is created. If the expanded list cannot be
/// allocated the set is left unchanged.
pub fn normalize_clones(set: &mut PartitionUsageSet) {
    let extra: usize = set
        .entries
        .iter()
        .filter(|e| !e.is_materialized())
        .filter_map(|e| e.clone.as_ref())
        .filter(|c| c.index.is_none())
        .map(|c| c.source.parts.len().saturating_sub(1))
        .sum();

    let mut expanded: Vec<PartitionUsageInfo> = Vec::new();
    if expanded.try_reserve(set.entries.len() + extra).is_err() {
        warn!("Cannot expand clone requests, keeping {} entries", set.entries.len());
        return;
    }

    for entry in set.entries.drain(..) {
        let source = match entry.clone.as_ref() {
            Some(sel) if sel.index.is_none() && !entry.is_materialized() => {
                Some(Rc::clone(&sel.source))
            }
            _ => None,
        };
        let Some(source) = source else {
            expanded.push(entry);
            continue;
        };
        debug!(
            "Expanding clone of {} partition(s) from {}",
            source.parts.len(),
            source.scheme
        );
        for (index, part) in source.parts.iter().enumerate() {
            let mut copy = entry.clone();
            // a single extend entry: the first copy keeps it
            if index > 0 {
                copy.clear_extend();
            }
            copy.size = part.size;
            copy.clone = Some(CloneSelection {
                source: Rc::clone(&source),
                index: Some(index),
            });
            expanded.push(copy);
        }
    }

    set.entries = expanded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::scheme::{DiskPartInfo, FsType, GenericPartType};
    use crate::disk::usage::CloneSource;

    fn source(sizes: &[i64]) -> Rc<CloneSource> {
        Rc::new(CloneSource {
            scheme: "gpt".to_string(),
            parts: sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| DiskPartInfo {
                    start: 2048 + i as i64 * 100_000,
                    size,
                    generic_type: GenericPartType::Root,
                    fs_type: FsType::Ffs,
                    ..Default::default()
                })
                .collect(),
            with_data: true,
        })
    }

    fn clone_entry(src: &Rc<CloneSource>) -> PartitionUsageInfo {
        let mut entry = PartitionUsageInfo::new("", GenericPartType::Root, FsType::Ffs);
        entry.clone = Some(CloneSelection::all(Rc::clone(src)));
        entry
    }

    #[test]
    fn one_entry_per_source() {
        let src = source(&[1000, 2000, 3000]);
        let mut set = PartitionUsageSet {
            entries: vec![
                PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs).with_size(500),
                clone_entry(&src),
                PartitionUsageInfo::new("/var", GenericPartType::Root, FsType::Ffs).with_size(700),
            ],
            ..Default::default()
        };

        normalize_clones(&mut set);

        assert_eq!(set.entries.len(), 5);
        assert_eq!(set.entries[0].mount, "/");
        for (i, expected) in [1000, 2000, 3000].iter().enumerate() {
            let entry = &set.entries[1 + i];
            assert_eq!(entry.size, *expected);
            let sel = entry.clone.as_ref().unwrap();
            assert_eq!(sel.index, Some(i));
            assert_eq!(sel.selected().unwrap().size, *expected);
        }
        assert_eq!(set.entries[4].mount, "/var");
    }

    #[test]
    fn materialized_clones_are_untouched() {
        let src = source(&[1000, 2000]);
        let mut entry = clone_entry(&src);
        entry.cur_part_id = Some(3);
        entry.size = 42;
        let mut set = PartitionUsageSet {
            entries: vec![entry.clone()],
            ..Default::default()
        };

        normalize_clones(&mut set);
        assert_eq!(set.entries, vec![entry]);
    }

    #[test]
    fn extend_stays_on_the_first_copy() {
        let src = source(&[1000, 2000]);
        let mut set = PartitionUsageSet {
            entries: vec![
                PartitionUsageInfo::new("/", GenericPartType::Root, FsType::Ffs).with_size(500),
                clone_entry(&src).extending(),
            ],
            ..Default::default()
        };
        set.validate().unwrap();

        normalize_clones(&mut set);

        assert_eq!(set.entries.len(), 3);
        assert_eq!(set.extend_index(), Some(1));
        assert!(!set.entries[2].extend());
        set.validate().unwrap();
    }

    #[test]
    fn normalizing_twice_does_not_multiply() {
        let src = source(&[1000, 2000]);
        let mut set = PartitionUsageSet {
            entries: vec![clone_entry(&src)],
            ..Default::default()
        };
        normalize_clones(&mut set);
        normalize_clones(&mut set);
        assert_eq!(set.entries.len(), 2);
    }
}
