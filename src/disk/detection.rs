//! Host and disk facts read from procfs/sysfs

use crate::disk::scheme::{Sectors, DEFAULT_SECTOR_SIZE};
use crate::utils::error::{PlanError, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// RAM assumed when /proc/meminfo cannot be read
pub const FALLBACK_RAM_MIB: i64 = 8192;

/// Geometry of a block device
#[derive(Debug, Clone, PartialEq)]
pub struct DiskGeometry {
    /// Device name (e.g., sda)
    pub name: String,
    /// Size in logical sectors
    pub sectors: Sectors,
    pub sector_size: i64,
    /// Device model (if available)
    pub model: Option<String>,
}

impl DiskGeometry {
    pub fn size_bytes(&self) -> i64 {
        self.sectors * self.sector_size
    }

    /// Get human-readable size
    pub fn size_human(&self) -> String {
        size_human(self.size_bytes())
    }
}

/// Format a byte count with a binary unit suffix
pub fn size_human(bytes: i64) -> String {
    const KIB: i64 = 1024;
    const MIB: i64 = KIB * 1024;
    const GIB: i64 = MIB * 1024;
    const TIB: i64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Read a sysfs attribute, returning None if not available
fn read_sysfs_attr(device: &str, attr: &str) -> Option<String> {
    let path = format!("/sys/block/{}/{}", device, attr);
    fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
}

/// Read a numeric sysfs attribute
fn read_sysfs_i64(device: &str, attr: &str) -> Option<i64> {
    read_sysfs_attr(device, attr).and_then(|s| s.parse().ok())
}

/// Look up the geometry of `device_path` (e.g. /dev/sda)
pub fn get_disk_geometry(device_path: &str) -> Result<DiskGeometry> {
    let name = Path::new(device_path)
        .file_name()
        .ok_or_else(|| PlanError::ConfigError(format!("not a device path: {}", device_path)))?
        .to_string_lossy()
        .to_string();

    // sysfs always counts 512-byte units, whatever the logical block size
    let size_512 = read_sysfs_i64(&name, "size")
        .ok_or_else(|| PlanError::ConfigError(format!("device not found: {}", device_path)))?;
    let sector_size =
        read_sysfs_i64(&name, "queue/logical_block_size").unwrap_or(DEFAULT_SECTOR_SIZE);
    let model =
        read_sysfs_attr(&name, "device/model").or_else(|| read_sysfs_attr(&name, "device/name"));

    let geometry = DiskGeometry {
        sectors: size_512 * 512 / sector_size.max(1),
        sector_size,
        model,
        name,
    };
    debug!(
        "{}: {} sectors of {} bytes ({})",
        device_path,
        geometry.sectors,
        geometry.sector_size,
        geometry.size_human()
    );
    Ok(geometry)
}

/// MemTotal from a /proc/meminfo dump, in MiB
fn parse_meminfo(meminfo: &str) -> Option<i64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<i64>().ok())
        .map(|kb| kb / 1024)
}

/// Get the amount of RAM in MiB
pub fn get_ram_mib() -> i64 {
    let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
    parse_meminfo(&meminfo).unwrap_or(FALLBACK_RAM_MIB)
}

/// Whether a /proc/filesystems dump lists tmpfs
fn lists_tmpfs(filesystems: &str) -> bool {
    filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == "tmpfs")
}

/// Whether the running kernel can mount tmpfs
pub fn tmpfs_available() -> bool {
    fs::read_to_string("/proc/filesystems")
        .map(|s| lists_tmpfs(&s))
        .unwrap_or(false)
}
