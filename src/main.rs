//! vmchain CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmchain::config::VmchainConfig;

mod cli;

/// vmchain - snapshot chains for virtual machine instances
#[derive(Parser, Debug)]
#[command(name = "vmchain")]
#[command(about = "Snapshot chains for virtual machine instances")]
#[command(version)]
struct Cli {
    /// Config file (default: the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record an instance backed by a base image.
    Register(cli::register::RegisterCmd),

    /// Capture a snapshot.
    Snapshot(cli::snapshot::SnapshotCmd),

    /// Restore a snapshot.
    Restore(cli::restore::RestoreCmd),

    /// Delete a snapshot.
    #[command(alias = "rm")]
    Delete(cli::delete::DeleteCmd),

    /// Show one snapshot.
    Info(cli::info::InfoCmd),

    /// List instances or snapshots.
    #[command(alias = "ls")]
    List(cli::list::ListCmd),

    /// Manage availability zones.
    #[command(subcommand)]
    Zone(cli::zone::ZoneCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = vmchain::VERSION, "starting vmchain");

    let loaded = match &cli.config {
        Some(path) => VmchainConfig::load_from(path),
        None => VmchainConfig::load(),
    };
    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            VmchainConfig::default()
        }
    };
    if let Some(dir) = &cli.data_dir {
        if let Err(e) = config.set_data_dir(dir) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = match cli::Context::new(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let command = cli.command;
    let result = runtime.block_on(async move {
        match command {
            Commands::Register(cmd) => cmd.run(&ctx),
            Commands::Snapshot(cmd) => cmd.run(&ctx).await,
            Commands::Restore(cmd) => cmd.run(&ctx).await,
            Commands::Delete(cmd) => cmd.run(&ctx).await,
            Commands::Info(cmd) => cmd.run(&ctx).await,
            Commands::List(cmd) => cmd.run(&ctx).await,
            Commands::Zone(cmd) => cmd.run(&ctx).await,
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, kind = ?e.kind(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmchain=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // VMCHAIN_LOG_FORMAT=json for machine-readable logs
    match std::env::var("VMCHAIN_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}
