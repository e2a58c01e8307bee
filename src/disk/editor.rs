//! Changing the size of a single wanted entry
//!
//! The menu that collects the new value lives outside this crate; the
//! rules that keep the set consistent after the change live here.

use crate::disk::scheme::{DiskSchemes, Sectors, MEG};
use crate::disk::sync::relink_by_start;
use crate::disk::usage::{PartitionUsageInfo, PartitionUsageSet};
use crate::utils::error::{PlanError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*([sSkKmMgGtT%]?)\s*(\+?)\s*$").expect("size pattern is valid")
});

/// Amount part of a size request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeValue {
    Sectors(Sectors),
    /// Share of RAM, for tmpfs-like entries
    Percent(i64),
}

/// A parsed size edit: the new size and whether the entry should take
/// all remaining space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRequest {
    pub value: SizeValue,
    pub extend: bool,
}

/// Parse `512M`, `2G+`, `4096s`, `25%` and the like
///
/// A bare number is in MiB. A trailing `+` asks for the entry to extend
/// over whatever space is left.
pub fn parse_size_request(text: &str, sector_size: i64) -> Result<SizeRequest> {
    let caps = SIZE_RE
        .captures(text)
        .ok_or_else(|| PlanError::InvalidSize(format!("cannot parse \"{}\"", text.trim())))?;
    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| PlanError::InvalidSize(format!("\"{}\" is too large", &caps[1])))?;
    let sector_size = sector_size.max(1);
    let bytes = |mult: i64| {
        amount
            .checked_mul(mult)
            .map(|b| b / sector_size)
            .ok_or_else(|| PlanError::InvalidSize(format!("\"{}\" is too large", text.trim())))
    };

    let value = match caps[2].to_ascii_lowercase().as_str() {
        "s" => SizeValue::Sectors(amount),
        "k" => SizeValue::Sectors(bytes(1024)?),
        "" | "m" => SizeValue::Sectors(bytes(MEG)?),
        "g" => SizeValue::Sectors(bytes(1024 * 1024 * 1024)?),
        "t" => SizeValue::Sectors(bytes(1024 * 1024 * 1024 * 1024)?),
        _ => SizeValue::Percent(amount),
    };
    Ok(SizeRequest {
        value,
        extend: !caps[3].is_empty(),
    })
}

/// Give the root entry back to the free pool when `/usr` gets a size of
/// its own while root still holds the default computed for a shared root
fn release_root_for_usr(set: &mut PartitionUsageSet, usr: usize, usr_ref_size: Sectors) -> Result<()> {
    let Some(root) = set.find_mount("/") else {
        return Ok(());
    };
    let entry = &set.entries[root];
    if entry.is_materialized() || entry.size != usr_ref_size {
        return Ok(());
    }
    let released = entry.size - entry.def_size;
    let had_extend = entry.extend();
    set.entries[root].size = set.entries[root].def_size;
    set.cur_free_space += released;
    if had_extend {
        set.set_extend(Some(usr))?;
    }
    debug!(
        "/usr sized separately, root back to {} sectors",
        set.entries[root].size
    );
    Ok(())
}

/// Change the size of `set.entries[idx]`
///
/// An existing partition is deleted first, after `confirm_delete`
/// agrees; the entry is then re-created by the allocator.
pub fn set_entry_size<F>(
    set: &mut PartitionUsageSet,
    schemes: &mut DiskSchemes,
    idx: usize,
    request: SizeRequest,
    mut confirm_delete: F,
) -> Result<()>
where
    F: FnMut(&PartitionUsageInfo) -> bool,
{
    let entry = set
        .entries
        .get(idx)
        .ok_or_else(|| PlanError::InvariantViolation(format!("no entry {}", idx)))?;
    let name = entry.display_name();

    let mut new_size = match (entry.is_ram_backed(), request.value) {
        (true, SizeValue::Percent(p)) if (0..=100).contains(&p) => -p,
        (true, SizeValue::Percent(p)) => {
            return Err(PlanError::InvalidSize(format!(
                "{}: {}% is not a share of RAM",
                name, p
            )))
        }
        (true, SizeValue::Sectors(_)) => {
            return Err(PlanError::InvalidSize(format!(
                "{} is sized as a percentage of RAM",
                name
            )))
        }
        (false, SizeValue::Percent(_)) => {
            return Err(PlanError::InvalidSize(format!(
                "{} lives on disk and needs an absolute size",
                name
            )))
        }
        (false, SizeValue::Sectors(s)) => s,
    };
    if entry.limit > 0 && new_size > entry.limit - entry.cur_start {
        new_size = entry.limit - entry.cur_start;
        info!("{} limited to {} sectors", name, new_size);
    }

    let old_size = set.entries[idx].size;
    let usr_ref_size = set.entries[idx].def_size;
    if new_size == old_size {
        if request.extend {
            set.set_extend(Some(idx))?;
        }
        return Ok(());
    }

    if let Some(id) = set.entries[idx].cur_part_id {
        if !confirm_delete(&set.entries[idx]) {
            return Err(PlanError::UserCancelled);
        }
        let owner = set.entries[idx].owner;
        schemes.scheme_mut(owner).delete_partition(id)?;
        info!("Deleted partition {} ({}) for resizing", id, name);
        set.entries[idx].cur_part_id = None;
        relink_by_start(set, schemes);
    }
    if request.extend {
        set.set_extend(Some(idx))?;
    }

    let entry = &mut set.entries[idx];
    entry.size = new_size;
    if entry.counts_against_free_space() {
        set.cur_free_space += old_size - new_size;
    }

    if set.entries[idx].mount == "/usr" && old_size == 0 && new_size > 0 {
        release_root_for_usr(set, idx, usr_ref_size)?;
    }
    debug!(
        "{}: {} -> {} sectors, {} free",
        name, old_size, new_size, set.cur_free_space
    );
    Ok(())
}
