//! Node Boot Storage
//!
//! Command-line front end: loads a node record, runs one lifecycle operation
//! against the array named in it and prints the updated record.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_boot_storage::config::STDIN_ARG;
use node_boot_storage::{
    apply_defaults, load_node_config, render_node_config, NodeOverrides, NodeStorageConfig,
    Orchestrator, OrchestratorConfig, OutputFormat, Profile,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Boot Storage - SAN boot LUN provisioning for bare-metal nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node record: file path, inline JSON, or STDIN
    #[arg(short, long, env = "NODE_CONFIG", default_value = STDIN_ARG)]
    config: String,

    /// Boot storage layout (classic, harvester)
    #[arg(short, long, env = "BOOT_PROFILE", default_value = "classic")]
    profile: Profile,

    /// Output format of the updated record (yaml, json)
    #[arg(short, long, env = "OUTPUT_FORMAT", default_value = "yaml")]
    output: OutputFormat,

    /// Override the node host name
    #[arg(long, env = "HOST_NAME")]
    host_name: Option<String>,

    /// Override the OS image the boot LUN is copied from
    #[arg(long, env = "OS_IMAGE")]
    image: Option<String>,

    /// Override the seed template location
    #[arg(long, env = "SEED_TEMPLATE")]
    template: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check capacity, image, template and fabric reachability
    Preflight,
    /// Provision boot, NVMe and seed storage
    Create,
    /// Read back observed state into the record
    Discover,
    /// Grow LUNs, namespace and volume to the record's sizes
    Resize,
    /// Replace all LUNs, keeping the volume and its snapshots
    Rebuild,
    /// Remove all of the node's storage
    Delete,
    /// Remove LUNs, keeping the volume and its snapshots
    DeleteLuns,
    /// Re-create LUN mappings
    RestoreMapping,
    /// Keep only the boot LUN, mapped at id 0
    Remap,
    /// Boot volume snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// OS image repository
    #[command(subcommand)]
    Image(ImageCommand),
    /// Cloud-init template repository
    #[command(subcommand)]
    Template(TemplateCommand),
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    Create {
        name: String,
        #[arg(long)]
        comment: Option<String>,
    },
    Delete {
        name: String,
    },
    /// Roll back to a snapshot and re-create mappings
    Restore {
        name: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Upload an image from a URL or local path
    Upload { name: String, location: String },
    Delete { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    /// Upload a template from a URL or local path
    Upload { name: String, location: String },
    Delete { name: String },
    List,
    /// Write a template to a file, or standard output
    Download {
        name: String,
        #[arg(long)]
        dest: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting {} {}", node_boot_storage::NAME, node_boot_storage::VERSION);

    let mut cfg = load_node_config(&args.config).context("failed to load node record")?;
    let overrides = NodeOverrides {
        host_name: args.host_name.clone(),
        image: args.image.clone(),
        template_location: args.template.clone(),
    };
    apply_defaults(&mut cfg, args.profile, &overrides)?;
    info!("  Host: {}", cfg.compute.host_name);
    info!("  Profile: {}", args.profile);
    info!("  Array: {}", cfg.storage.cdot_credentials.host);

    let orchestrator = Orchestrator::connect(
        &cfg,
        OrchestratorConfig {
            profile: args.profile,
        },
    )
    .await
    .context("failed to connect to the array")?;
    // The resolved scope is part of every printed record
    cfg.storage.svm_name = orchestrator.backend().svm_name().to_string();

    let print_record = run(&orchestrator, &mut cfg, args.command).await?;
    if print_record {
        println!("{}", render_node_config(&cfg, args.output)?);
    }
    Ok(())
}

/// Run one command; returns whether the record should be printed
async fn run(
    orchestrator: &Orchestrator,
    cfg: &mut NodeStorageConfig,
    command: Command,
) -> anyhow::Result<bool> {
    match command {
        Command::Preflight => {
            orchestrator.preflight(cfg).await?;
            info!("Preflight passed for {}", cfg.compute.host_name);
            Ok(false)
        }
        Command::Create => {
            let discovery = orchestrator.provision(cfg).await?;
            cfg.apply(&discovery);
            Ok(true)
        }
        Command::Discover => {
            match orchestrator.discover(cfg).await? {
                Some(discovery) => cfg.apply(&discovery),
                None => warn!("No storage found for {}", cfg.compute.host_name),
            }
            Ok(true)
        }
        Command::Resize => {
            let discovery = orchestrator.resize(cfg).await?;
            cfg.apply(&discovery);
            Ok(true)
        }
        Command::Rebuild => {
            let discovery = orchestrator.rebuild(cfg).await?;
            cfg.apply(&discovery);
            Ok(true)
        }
        Command::Delete => {
            orchestrator.deprovision(cfg).await?;
            Ok(false)
        }
        Command::DeleteLuns => {
            orchestrator.delete_luns(cfg).await?;
            Ok(false)
        }
        Command::RestoreMapping => {
            orchestrator.restore_mapping(cfg).await?;
            Ok(false)
        }
        Command::Remap => {
            orchestrator.remap(cfg).await?;
            Ok(false)
        }
        Command::Snapshot(command) => run_snapshot(orchestrator, cfg, command).await,
        Command::Image(command) => {
            let repos = orchestrator.repos();
            match command {
                ImageCommand::Upload { name, location } => {
                    repos.image_upload(cfg, &name, &location).await?
                }
                ImageCommand::Delete { name } => repos.image_delete(cfg, &name).await?,
                ImageCommand::List => print_names(&repos.image_list(cfg).await?),
            }
            Ok(false)
        }
        Command::Template(command) => {
            let repos = orchestrator.repos();
            match command {
                TemplateCommand::Upload { name, location } => {
                    repos.template_upload(cfg, &name, &location).await?
                }
                TemplateCommand::Delete { name } => repos.template_delete(cfg, &name).await?,
                TemplateCommand::List => print_names(&repos.template_list(cfg).await?),
                TemplateCommand::Download { name, dest } => {
                    let content = repos.template_download(cfg, &name).await?;
                    match dest {
                        Some(path) => tokio::fs::write(&path, &content)
                            .await
                            .with_context(|| format!("failed to write {}", path))?,
                        None => std::io::stdout().write_all(&content)?,
                    }
                }
            }
            Ok(false)
        }
    }
}

async fn run_snapshot(
    orchestrator: &Orchestrator,
    cfg: &mut NodeStorageConfig,
    command: SnapshotCommand,
) -> anyhow::Result<bool> {
    let snapshots = orchestrator.snapshots();
    match command {
        SnapshotCommand::Create { name, comment } => {
            snapshots.create(cfg, &name, comment.as_deref()).await?
        }
        SnapshotCommand::Delete { name } => snapshots.delete(cfg, &name).await?,
        SnapshotCommand::Restore { name } => orchestrator.restore_snapshot(cfg, &name).await?,
        SnapshotCommand::List => {
            print_names(&snapshots.list(cfg).await?);
            return Ok(false);
        }
    }
    cfg.storage.snapshots = snapshots.list(cfg).await?;
    Ok(true)
}

fn print_names(names: &[String]) {
    for name in names {
        println!("{}", name);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr; stdout carries the record
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn,rustls=warn", level))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
