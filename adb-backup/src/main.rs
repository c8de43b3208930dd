//! adb-backup - Main entry point
//!
//! Incremental backup of an Android device into a local directory.

use adb_backup::exclude::ExcludeSet;
use adb_backup::executor::{RunController, RunOptions};
use adb_backup::remote::adb::AdbBridge;
use adb_backup::shutdown::ShutdownCoordinator;
use adb_backup::{config::Config, utils};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local directory holding the backup
    #[arg(value_name = "DEST")]
    dest: PathBuf,

    /// File of exclude patterns (may be repeated)
    #[arg(short = 'x', long = "exclude", value_name = "FILE")]
    exclude: Vec<PathBuf>,

    /// Ignore the previous manifest and fetch everything
    #[arg(long = "new")]
    fresh: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial of the device to back up (overrides config)
    #[arg(short, long)]
    serial: Option<String>,

    /// Directory on the device to back up (overrides config)
    #[arg(short, long, value_name = "PATH")]
    remote_root: Option<String>,

    /// Path to the adb executable (overrides config)
    #[arg(long, value_name = "PATH")]
    adb: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };

    if let Some(serial) = args.serial {
        config.device.serial = Some(serial);
    }
    if let Some(root) = args.remote_root {
        config.device.remote_root = root;
    }
    if let Some(adb) = args.adb {
        config.device.adb_path = adb;
    }
    config.validate()?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting adb-backup v{}: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.device.remote_root,
        args.dest.display()
    );

    let excludes = ExcludeSet::from_files(args.exclude.as_slice())?;

    let bridge = Arc::new(AdbBridge::new(
        config.device.adb_path.clone(),
        config.device.serial.clone(),
        config.device.remote_root.clone(),
        config.device.connect_timeout(),
    ));

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_listener();

    let mut options = RunOptions::from_config(&config);
    options.fresh = args.fresh;

    let mut controller = RunController::new(
        bridge.clone(),
        bridge,
        Box::new(excludes),
        args.dest,
        options,
        shutdown.token(),
    );

    let result = controller.run().await;
    listener.abort();

    let summary = result.context("backup failed")?;
    summary.log();
    Ok(())
}
