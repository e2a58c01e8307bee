//! Planning session orchestrator

use crate::config::{PlanConfig, SizeEdit};
use crate::disk::clones::normalize_clones;
use crate::disk::editor::{parse_size_request, set_entry_size};
use crate::disk::layouts::{fill_defaults, SystemFacts};
use crate::disk::partitioning::{apply_settings_to_partitions, AllocationReport};
use crate::disk::scheme::{DiskSchemes, FsType, GenericPartType, Sectors};
use crate::disk::usage::{CloneSelection, PartitionUsageInfo, PartitionUsageSet};
use crate::install::target::InstallPartitionDesc;
use crate::utils::error::{PlanError, Result};
use crate::utils::prompt::confirm_delete;
use std::rc::Rc;
use tracing::info;

/// Everything a finished planning session produced
#[derive(Debug)]
pub struct PlanOutcome {
    pub desc: InstallPartitionDesc,
    pub report: AllocationReport,
    pub set: PartitionUsageSet,
    pub schemes: DiskSchemes,
    pub region: (Sectors, Sectors),
}

/// Drives one planning session from configuration to descriptor
pub struct Planner {
    config: PlanConfig,
    extra_edits: Vec<SizeEdit>,
    /// Delete existing partitions without asking
    skip_confirm: bool,
}

impl Planner {
    pub fn new(config: PlanConfig) -> Self {
        Self {
            config,
            extra_edits: Vec::new(),
            skip_confirm: false,
        }
    }

    /// Skip the interactive confirmation prompt.
    pub fn with_skip_confirm(mut self, skip: bool) -> Self {
        self.skip_confirm = skip;
        self
    }

    /// Size edits applied after the configured ones
    pub fn with_edits(mut self, edits: Vec<SizeEdit>) -> Self {
        self.extra_edits = edits;
        self
    }

    /// Run the full planning process
    pub fn run(self) -> Result<PlanOutcome> {
        // Phase 1: Disk and machine facts
        self.config.validate()?;
        let mut schemes = self.config.build_schemes()?;
        let (_, sector_size) = self.config.geometry()?;
        let facts = self.config.system_facts(sector_size);
        let region = self.config.install_region(&schemes)?;
        let reserved = self.config.reserved_sectors(sector_size);
        info!(
            "Planning {} region {}+{} ({} MiB RAM)",
            schemes.inner.scheme_name(),
            region.0,
            region.1,
            facts.ram_mib
        );

        // Phase 2: Default layout
        let mut set = fill_defaults(
            &schemes,
            region.0,
            region.1,
            reserved,
            &self.config.layout,
            &facts,
        );
        self.add_clone_requests(&mut set, sector_size);

        // Phase 3: Size edits
        for edit in self.config.edits.iter().chain(self.extra_edits.iter()) {
            self.apply_edit(&mut set, &mut schemes, &facts, edit)?;
        }

        // Phase 4: Allocation
        normalize_clones(&mut set);
        let report = apply_settings_to_partitions(&mut set, &mut schemes, region.0, region.1)?;

        // Phase 5: Hand-off
        let desc = InstallPartitionDesc::from_set(&set, schemes.inner.scheme_name(), sector_size);
        desc.verify()?;
        info!("Plan complete: {} partitions", desc.partitions.len());

        Ok(PlanOutcome {
            desc,
            report,
            set,
            schemes,
            region,
        })
    }

    fn add_clone_requests(&self, set: &mut PartitionUsageSet, sector_size: i64) {
        for (mount, source) in self.config.clone_sources(sector_size) {
            let mut entry = PartitionUsageInfo::new(&mount, GenericPartType::Undef, FsType::Unused);
            entry.clone = Some(CloneSelection::all(Rc::new(source)));
            set.entries.push(entry);
        }
    }

    fn apply_edit(
        &self,
        set: &mut PartitionUsageSet,
        schemes: &mut DiskSchemes,
        facts: &SystemFacts,
        edit: &SizeEdit,
    ) -> Result<()> {
        let request = parse_size_request(&edit.size, facts.sector_size)?;
        let idx = match set.find_mount(&edit.mount) {
            Some(idx) => idx,
            None => {
                // new mount points start out as plain FFS entries
                set.entries.push(PartitionUsageInfo::new(
                    &edit.mount,
                    GenericPartType::Root,
                    FsType::Ffs,
                ));
                set.entries.len() - 1
            }
        };
        info!("Setting {} to {}", edit.mount, edit.size);

        let auto_confirm = self.skip_confirm || edit.confirm_delete;
        let mut prompt_failed = None;
        let result = set_entry_size(set, schemes, idx, request, |entry| {
            if auto_confirm {
                return true;
            }
            match confirm_delete(&entry.display_name()) {
                Ok(answer) => answer,
                Err(e) => {
                    prompt_failed = Some(e);
                    false
                }
            }
        });
        match (result, prompt_failed) {
            (Err(PlanError::UserCancelled), Some(e)) => Err(e),
            (result, _) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutTemplate, PartitionConfig};

    fn config(text: &str) -> PlanConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn fresh_disk_end_to_end() {
        let cfg = config(
            r#"
[disk]
size_mib = 4000

[system]
ram_mib = 512
tmpfs = true

[[edits]]
mount = "/var"
size = "500M"
"#,
        );
        let outcome = Planner::new(cfg).run().unwrap();
        assert!(outcome.report.is_complete());

        let desc = &outcome.desc;
        let var = desc.partitions.iter().find(|p| p.mount == "/var").unwrap();
        assert_eq!(var.size, 500 * 2048);
        assert!(var.is_materialized());
        let tmp = desc.partitions.iter().find(|p| p.mount == "/tmp").unwrap();
        assert_eq!(tmp.fs, FsType::Tmpfs);
        assert!(!tmp.is_materialized());
        assert!(desc.root().unwrap().flags.newfs);
        // root extends over the rest of the disk
        assert!(outcome.set.cur_free_space <= 2048);
    }

    #[test]
    fn existing_partition_edit_needs_confirmation() {
        let mut cfg = config(
            r#"
[disk]
size_mib = 4000

[[disk.partitions]]
start_mib = 1
size_mib = 1000
fs = "ffs"
mount = "/"

[system]
ram_mib = 256
tmpfs = false
"#,
        );
        cfg.edits.push(SizeEdit {
            mount: "/".to_string(),
            size: "2G".to_string(),
            confirm_delete: true,
        });
        let outcome = Planner::new(cfg).run().unwrap();
        let root = outcome.desc.root().unwrap();
        assert_eq!(root.size, 2048 * 2048);
        assert!(root.flags.newfs);
    }

    #[test]
    fn shortfall_is_reported() {
        let mut cfg = config(
            r#"
[disk]
size_mib = 100

[system]
ram_mib = 64
tmpfs = false
swap = false
"#,
        );
        cfg.layout = LayoutTemplate {
            root_extends: false,
            ..LayoutTemplate::default()
        };
        let outcome = Planner::new(cfg)
            .with_edits(vec![SizeEdit::parse_assignment("/home=200M").unwrap()])
            .run();
        assert!(matches!(outcome, Err(PlanError::AllocationShortfall(_))));
    }

    #[test]
    fn clone_requests_are_expanded() {
        let mut cfg = config(
            r#"
[disk]
size_mib = 4000

[system]
ram_mib = 256
tmpfs = true
"#,
        );
        cfg.clones.push(crate::config::CloneConfig {
            scheme: "mbr".to_string(),
            mount: String::new(),
            with_data: true,
            sources: vec![
                PartitionConfig {
                    start_mib: 1,
                    size_mib: 30,
                    generic_type: GenericPartType::Fat,
                    fs: FsType::Msdos,
                    mount: None,
                    boot: false,
                    install_target: false,
                    container: false,
                },
                PartitionConfig {
                    start_mib: 40,
                    size_mib: 60,
                    generic_type: GenericPartType::Root,
                    fs: FsType::Ffs,
                    mount: None,
                    boot: false,
                    install_target: false,
                    container: false,
                },
            ],
        });
        let outcome = Planner::new(cfg).run().unwrap();
        let clones: Vec<_> = outcome
            .desc
            .partitions
            .iter()
            .filter(|p| p.clone_of.is_some())
            .collect();
        assert_eq!(clones.len(), 2);
        assert_eq!(clones[0].clone_of.as_deref(), Some("mbr@2048"));
        assert!(clones.iter().all(|p| p.is_materialized() && !p.flags.newfs));
    }
}
