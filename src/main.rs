//! partplan - partition layout planner for OS installers
//!
//! Reads a disk/system description, fills in a default layout, applies
//! size edits and prints the resulting partition plan.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use partplan::config::{PlanConfig, SizeEdit};
use partplan::disk::detection::{get_disk_geometry, get_ram_mib, tmpfs_available};
use partplan::install::{print_layout_summary, Planner};

#[derive(Parser)]
#[command(name = "partplan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a partition plan from a configuration file
    Plan {
        /// Path to configuration file
        #[arg(short, long)]
        config: String,

        /// Extra size edit, e.g. --set /var=2G or --set /=4G+
        #[arg(long = "set")]
        set: Vec<String>,

        /// Print the plan as JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Delete existing partitions without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "partplan.toml")]
        output: String,
    },

    /// Show the machine facts the planner would use
    Facts {
        /// Also show the geometry of this disk (e.g., /dev/sda)
        #[arg(short, long)]
        device: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Plan {
            config,
            set,
            json,
            yes,
        } => cmd_plan(&config, &set, json, yes)?,
        Commands::Validate { config } => cmd_validate(&config)?,
        Commands::GenerateConfig { output } => cmd_generate_config(&output)?,
        Commands::Facts { device } => cmd_facts(device.as_deref())?,
    }

    Ok(())
}

fn cmd_plan(config_path: &str, assignments: &[String], json: bool, yes: bool) -> Result<()> {
    info!("Loading configuration from {}", config_path);
    let config = PlanConfig::from_file(config_path)?;
    let edits = assignments
        .iter()
        .map(|a| SizeEdit::parse_assignment(a))
        .collect::<partplan::utils::error::Result<Vec<_>>>()?;

    let outcome = Planner::new(config)
        .with_edits(edits)
        .with_skip_confirm(yes)
        .run()?;

    if json {
        println!("{}", outcome.desc.to_json()?);
        return Ok(());
    }

    print_layout_summary(&outcome.desc);
    println!(
        "Placed {}, resized {}, free {} sectors",
        outcome.report.placed.len(),
        outcome.report.resized.len(),
        outcome.set.cur_free_space
    );
    for name in &outcome.report.unplaced {
        warn!("{} did not get a partition", name);
    }
    Ok(())
}

fn cmd_validate(config_path: &str) -> Result<()> {
    let config = PlanConfig::from_file(config_path)?;
    config.validate()?;
    println!("✓ Configuration is valid");
    Ok(())
}

fn cmd_generate_config(output: &str) -> Result<()> {
    let content = PlanConfig::sample().to_toml()?;
    std::fs::write(output, content)?;
    println!("✓ Sample configuration written to {}", output);
    Ok(())
}

fn cmd_facts(device: Option<&str>) -> Result<()> {
    println!("{:<12} {} MiB", "RAM", get_ram_mib());
    println!(
        "{:<12} {}",
        "tmpfs",
        if tmpfs_available() { "yes" } else { "no" }
    );

    if let Some(device) = device {
        let geometry = get_disk_geometry(device)?;
        println!("{:<12} {}", "DEVICE", geometry.name);
        println!(
            "{:<12} {} ({} sectors of {} bytes)",
            "SIZE",
            geometry.size_human(),
            geometry.sectors,
            geometry.sector_size
        );
        println!(
            "{:<12} {}",
            "MODEL",
            geometry.model.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
