//! Plan description: disk, machine facts, layout template and edits

use crate::disk::detection::{get_disk_geometry, get_ram_mib, tmpfs_available};
use crate::disk::editor::parse_size_request;
use crate::disk::layouts::SystemFacts;
use crate::disk::memory::MemoryScheme;
use crate::disk::scheme::{
    mib_to_sectors, DiskPartInfo, DiskSchemes, FsType, GenericPartType, PartInfoFlags,
    PartitionSpaceBackend, Sectors, DEFAULT_SECTOR_SIZE,
};
use crate::disk::usage::CloneSource;
use crate::utils::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Main plan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub disk: DiskConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub layout: LayoutTemplate,
    /// Partitions to copy into the new layout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clones: Vec<CloneConfig>,
    /// Size changes applied on top of the default layout, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<SizeEdit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Partitioning scheme of the disk (e.g., "gpt", "mbr")
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Read size and sector size from this block device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Disk size when no device is given
    #[serde(default)]
    pub size_mib: i64,
    #[serde(default = "default_sector_size")]
    pub sector_size: i64,
    /// Partition alignment
    #[serde(default = "default_alignment_kib")]
    pub alignment_kib: i64,
    /// Space kept out of the plan (e.g. for a parent scheme's header)
    #[serde(default)]
    pub reserved_mib: i64,
    /// Install region; defaults to the scheme's own guess
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionConfig>,
    /// Partitions already on the disk
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    /// Nested scheme inside one of the partitions (hybrid disks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<InnerSchemeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub start_mib: i64,
    pub size_mib: i64,
}

/// An existing partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub start_mib: i64,
    pub size_mib: i64,
    #[serde(default, rename = "type")]
    pub generic_type: GenericPartType,
    #[serde(default)]
    pub fs: FsType,
    /// Where the filesystem was last mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub install_target: bool,
    /// Holds the nested scheme described in `[disk.inner]`
    #[serde(default)]
    pub container: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerSchemeConfig {
    #[serde(default = "default_inner_scheme")]
    pub scheme: String,
    /// Start of the container partition in the outer table
    pub container_start_mib: i64,
    #[serde(default = "default_alignment_kib")]
    pub alignment_kib: i64,
    /// Ignore whatever the container holds and start from an empty table
    #[serde(default)]
    pub force_empty: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Installed RAM (default: read from /proc/meminfo)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_mib: Option<i64>,
    /// tmpfs support (default: read from /proc/filesystems)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<bool>,
    /// X11 sets are part of the installation
    #[serde(default)]
    pub x11: bool,
    #[serde(default = "default_true")]
    pub swap: bool,
    /// Firmware cannot load the kernel past this point (0: no limit)
    #[serde(default)]
    pub root_limit_mib: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            ram_mib: None,
            tmpfs: None,
            x11: false,
            swap: true,
            root_limit_mib: 0,
        }
    }
}

/// Swap sizing policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSize {
    /// As large as RAM
    #[default]
    Auto,
    None,
    Mib(i64),
}

/// Small partition placed ahead of root for the firmware or boot loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootHelper {
    pub size_mib: i64,
    pub fs: FsType,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub bootable: bool,
}

/// Static default layout, sizes in MiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutTemplate {
    pub root_mib: i64,
    /// Root takes whatever space is left
    pub root_extends: bool,
    pub swap: SwapSize,
    /// Disk-backed /tmp suggestion when tmpfs is not used
    pub tmp_mib: i64,
    pub usr_mib: i64,
    /// Give /usr its own partition from the start
    pub separate_usr: bool,
    pub var_mib: i64,
    pub boot_helpers: Vec<BootHelper>,
}

impl Default for LayoutTemplate {
    fn default() -> Self {
        LayoutTemplate {
            root_mib: 40,
            root_extends: true,
            swap: SwapSize::Auto,
            tmp_mib: 64,
            usr_mib: 800,
            separate_usr: false,
            var_mib: 64,
            boot_helpers: Vec::new(),
        }
    }
}

/// Existing partitions of another disk to copy into new partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Scheme the sources live in
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Mount point for the copies
    #[serde(default)]
    pub mount: String,
    /// Copy the data too, not only the allocation
    #[serde(default = "default_true")]
    pub with_data: bool,
    pub sources: Vec<PartitionConfig>,
}

/// Scripted size change, as typed in the size editor (`512M`, `2G+`, `25%`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeEdit {
    pub mount: String,
    pub size: String,
    /// Delete an existing partition without asking
    #[serde(default)]
    pub confirm_delete: bool,
}

impl SizeEdit {
    /// Parse `MOUNT=SIZE` as given on the command line
    pub fn parse_assignment(text: &str) -> Result<Self> {
        let (mount, size) = text.split_once('=').ok_or_else(|| {
            PlanError::ConfigError(format!("expected MOUNT=SIZE, got \"{}\"", text))
        })?;
        Ok(SizeEdit {
            mount: mount.trim().to_string(),
            size: size.trim().to_string(),
            confirm_delete: false,
        })
    }
}

// Default value functions

fn default_scheme() -> String {
    "gpt".to_string()
}

fn default_inner_scheme() -> String {
    "disklabel".to_string()
}

fn default_sector_size() -> i64 {
    DEFAULT_SECTOR_SIZE
}

fn default_alignment_kib() -> i64 {
    1024
}

fn default_true() -> bool {
    true
}

impl PartitionConfig {
    fn to_part_info(&self, sector_size: i64) -> DiskPartInfo {
        let generic_type = match (self.generic_type, self.container) {
            (GenericPartType::Undef, true) => GenericPartType::SecondaryContainer,
            (GenericPartType::Undef, false) => self.fs.generic_type(),
            (t, _) => t,
        };
        DiskPartInfo {
            start: mib_to_sectors(self.start_mib, sector_size),
            size: mib_to_sectors(self.size_mib, sector_size),
            generic_type,
            fs_type: self.fs,
            last_mounted: self.mount.clone(),
            flags: PartInfoFlags {
                boot: self.boot,
                install_target: self.install_target,
                sec_container: self.container,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn alignment_sectors(alignment_kib: i64, sector_size: i64) -> Sectors {
    (alignment_kib * 1024 / sector_size.max(1)).max(1)
}

impl PlanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PlanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        PlanConfig {
            disk: DiskConfig {
                scheme: "gpt".to_string(),
                device: None,
                size_mib: 20 * 1024,
                sector_size: DEFAULT_SECTOR_SIZE,
                alignment_kib: default_alignment_kib(),
                reserved_mib: 0,
                region: None,
                partitions: vec![PartitionConfig {
                    start_mib: 1,
                    size_mib: 512,
                    generic_type: GenericPartType::EfiSystem,
                    fs: FsType::Msdos,
                    mount: Some("/boot/efi".to_string()),
                    boot: true,
                    install_target: false,
                    container: false,
                }],
                inner: None,
            },
            system: SystemConfig {
                ram_mib: Some(2048),
                tmpfs: Some(true),
                x11: true,
                swap: true,
                root_limit_mib: 0,
            },
            layout: LayoutTemplate::default(),
            clones: Vec::new(),
            edits: vec![SizeEdit {
                mount: "/var".to_string(),
                size: "2G".to_string(),
                confirm_delete: false,
            }],
        }
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let disk = &self.disk;

        if disk.sector_size < 512 || disk.sector_size.count_ones() != 1 {
            return Err(PlanError::ValidationError(format!(
                "Sector size {} is not a power of two of at least 512",
                disk.sector_size
            )));
        }
        if disk.device.is_none() && disk.size_mib <= 0 {
            return Err(PlanError::ValidationError(
                "Either disk.device or a positive disk.size_mib is required".to_string(),
            ));
        }
        if disk.alignment_kib <= 0 {
            return Err(PlanError::ValidationError(
                "Alignment must be positive".to_string(),
            ));
        }
        if disk.reserved_mib < 0 {
            return Err(PlanError::ValidationError(
                "Reserved space cannot be negative".to_string(),
            ));
        }

        let mut all_parts: Vec<&PartitionConfig> = disk.partitions.iter().collect();
        if let Some(inner) = &disk.inner {
            all_parts.extend(inner.partitions.iter());
        }
        let clone_parts = self.clones.iter().flat_map(|c| c.sources.iter());
        for part in clone_parts.chain(all_parts.iter().copied()) {
            if part.start_mib < 0 || part.size_mib <= 0 {
                return Err(PlanError::ValidationError(format!(
                    "Partition at {} MiB needs a non-negative start and a positive size",
                    part.start_mib
                )));
            }
        }
        for part in all_parts {
            if disk.device.is_none() && part.start_mib + part.size_mib > disk.size_mib {
                return Err(PlanError::ValidationError(format!(
                    "Partition at {} MiB runs past the end of the disk",
                    part.start_mib
                )));
            }
        }

        if let Some(inner) = &disk.inner {
            let has_container = disk
                .partitions
                .iter()
                .any(|p| p.container && p.start_mib == inner.container_start_mib);
            if !has_container {
                return Err(PlanError::ValidationError(format!(
                    "No container partition at {} MiB for the inner {} scheme",
                    inner.container_start_mib, inner.scheme
                )));
            }
        }

        if self.layout.root_mib <= 0 {
            return Err(PlanError::ValidationError(
                "Root size must be positive".to_string(),
            ));
        }
        for helper in &self.layout.boot_helpers {
            if helper.size_mib <= 0 {
                return Err(PlanError::ValidationError(format!(
                    "Boot helper {} needs a positive size",
                    helper.fs
                )));
            }
        }

        for edit in &self.edits {
            if edit.mount.is_empty() {
                return Err(PlanError::ValidationError(
                    "Size edits need a mount point".to_string(),
                ));
            }
            parse_size_request(&edit.size, disk.sector_size)?;
        }

        Ok(())
    }

    /// Disk size and logical sector size, from the device when one is named
    pub fn geometry(&self) -> Result<(Sectors, i64)> {
        match &self.disk.device {
            Some(device) => {
                let geometry = get_disk_geometry(device)?;
                Ok((geometry.sectors, geometry.sector_size))
            }
            None => Ok((
                mib_to_sectors(self.disk.size_mib, self.disk.sector_size),
                self.disk.sector_size,
            )),
        }
    }

    /// In-memory partition tables matching the described disk
    pub fn build_schemes(&self) -> Result<DiskSchemes> {
        let disk = &self.disk;
        let (sectors, sector_size) = self.geometry()?;
        let align = alignment_sectors(disk.alignment_kib, sector_size);

        let mut outer = MemoryScheme::new(&disk.scheme, sectors, align);
        for part in &disk.partitions {
            outer.add_partition(&part.to_part_info(sector_size))?;
        }

        let Some(inner_cfg) = &disk.inner else {
            if let Some(region) = disk.region {
                outer = outer.with_region(
                    mib_to_sectors(region.start_mib, sector_size),
                    mib_to_sectors(region.size_mib, sector_size),
                );
            }
            debug!("Single {} scheme, {} sectors", disk.scheme, sectors);
            return Ok(DiskSchemes::single(Box::new(outer)));
        };

        let container_start = mib_to_sectors(inner_cfg.container_start_mib, sector_size);
        let inner_align = alignment_sectors(inner_cfg.alignment_kib, sector_size);
        let container = disk
            .partitions
            .iter()
            .find(|p| p.container && p.start_mib == inner_cfg.container_start_mib)
            .map(|p| p.to_part_info(sector_size))
            .ok_or_else(|| {
                PlanError::ConfigError(format!(
                    "No container partition at {} MiB",
                    inner_cfg.container_start_mib
                ))
            })?;

        let mut inner = MemoryScheme::new(&inner_cfg.scheme, sectors, inner_align)
            .with_region(container.start, container.size)
            .with_outer_partitions(true);
        for part in &inner_cfg.partitions {
            inner.add_partition(&part.to_part_info(sector_size))?;
        }
        let outer = outer
            .with_nested_defaults(&inner_cfg.scheme, inner_align)
            .with_nested(container_start, inner);
        debug!(
            "Hybrid {} + {} scheme, container at sector {}",
            disk.scheme, inner_cfg.scheme, container_start
        );
        DiskSchemes::nested(Box::new(outer), container_start, inner_cfg.force_empty)
    }

    /// Region to plan in: the configured one, or the scheme's guess
    pub fn install_region(&self, schemes: &DiskSchemes) -> Result<(Sectors, Sectors)> {
        match (self.disk.region, &self.disk.inner) {
            (Some(region), None) => {
                let (_, sector_size) = self.geometry()?;
                Ok((
                    mib_to_sectors(region.start_mib, sector_size),
                    mib_to_sectors(region.size_mib, sector_size),
                ))
            }
            _ => Ok(schemes.install_target()),
        }
    }

    pub fn reserved_sectors(&self, sector_size: i64) -> Sectors {
        mib_to_sectors(self.disk.reserved_mib, sector_size)
    }

    /// Machine facts, filling gaps from the running system
    pub fn system_facts(&self, sector_size: i64) -> SystemFacts {
        let sys = &self.system;
        SystemFacts {
            ram_mib: sys.ram_mib.unwrap_or_else(get_ram_mib),
            sector_size,
            tmpfs_available: sys.tmpfs.unwrap_or_else(tmpfs_available),
            x11_selected: sys.x11,
            swap_allowed: sys.swap,
            root_limit: mib_to_sectors(sys.root_limit_mib, sector_size),
        }
    }

    /// Clone requests as shared source lists
    pub fn clone_sources(&self, sector_size: i64) -> Vec<(String, CloneSource)> {
        self.clones
            .iter()
            .map(|c| {
                let source = CloneSource {
                    scheme: c.scheme.clone(),
                    parts: c.sources.iter().map(|p| p.to_part_info(sector_size)).collect(),
                    with_data: c.with_data,
                };
                (c.mount.clone(), source)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYBRID: &str = r#"
[disk]
scheme = "mbr"
size_mib = 8000

[[disk.partitions]]
start_mib = 1
size_mib = 100
type = "fat"
fs = "msdos"

[[disk.partitions]]
start_mib = 1000
size_mib = 6000
container = true

[disk.inner]
container_start_mib = 1000

[[disk.inner.partitions]]
start_mib = 1000
size_mib = 500
fs = "ffs"
mount = "/"

[system]
ram_mib = 512
tmpfs = false

[layout]
swap = { mib = 256 }
"#;

    #[test]
    fn sample_round_trips_and_validates() {
        let sample = PlanConfig::sample();
        sample.validate().unwrap();
        let parsed: PlanConfig = toml::from_str(&sample.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn hybrid_disk_builds_both_schemes() {
        let config: PlanConfig = toml::from_str(HYBRID).unwrap();
        config.validate().unwrap();
        assert_eq!(config.layout.swap, SwapSize::Mib(256));
        assert_eq!(config.layout.root_mib, 40);

        let schemes = config.build_schemes().unwrap();
        let outer = schemes.outer.as_deref().unwrap();
        assert_eq!(outer.scheme_name(), "mbr");
        assert_eq!(outer.num_part(), 2);
        assert_eq!(schemes.inner.scheme_name(), "disklabel");
        assert_eq!(schemes.inner.num_part(), 1);
        assert_eq!(schemes.inner.disk_start(), 1000 * 2048);
        assert_eq!(
            config.install_region(&schemes).unwrap(),
            (1000 * 2048, 6000 * 2048)
        );

        let facts = config.system_facts(512);
        assert_eq!(facts.ram_mib, 512);
        assert!(!facts.tmpfs_available);
    }

    #[test]
    fn missing_container_is_rejected() {
        let mut config: PlanConfig = toml::from_str(HYBRID).unwrap();
        config.disk.inner.as_mut().unwrap().container_start_mib = 1;
        assert!(matches!(
            config.validate(),
            Err(PlanError::ValidationError(_))
        ));
    }

    #[test]
    fn bad_edits_are_rejected() {
        let mut config = PlanConfig::sample();
        config.edits.push(SizeEdit {
            mount: "/usr".to_string(),
            size: "lots".to_string(),
            confirm_delete: false,
        });
        assert!(matches!(config.validate(), Err(PlanError::InvalidSize(_))));
    }

    #[test]
    fn assignment_parsing() {
        let edit = SizeEdit::parse_assignment("/usr = 2G+").unwrap();
        assert_eq!(edit.mount, "/usr");
        assert_eq!(edit.size, "2G+");
        assert!(SizeEdit::parse_assignment("/usr").is_err());
    }

    #[test]
    fn partition_outside_disk_is_rejected() {
        let mut config = PlanConfig::sample();
        config.disk.partitions[0].start_mib = 20 * 1024;
        assert!(config.validate().is_err());
    }
}
