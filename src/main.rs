//! RaidVault server
//!
//! Opens the configured drives, recovers interrupted operations and runs the
//! background daemons until interrupted.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    VirtualFileSystem                     │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐          │
//! │  │    Lock    │  │ Scheduler  │  │  Iterator  │  Drive   │
//! │  │  Sweeper   │  │   Worker   │  │   Purge    │  Sync    │
//! │  └────────────┘  └────────────┘  └────────────┘          │
//! └──────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use raidvault::config::ServerSettings;
use raidvault::VirtualFileSystem;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// RaidVault - Multi-drive object storage with RAID 0/1/6 redundancy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server settings (YAML)
    #[arg(long, short, env = "RAIDVAULT_CONFIG", default_value = "raidvault.yaml")]
    config: PathBuf,

    /// Drive roots, overriding the configuration
    #[arg(long = "drive", env = "RAIDVAULT_DRIVES", value_delimiter = ',')]
    drives: Vec<PathBuf>,

    /// Treat rollback failures during recovery as warnings
    #[arg(long, env = "RAIDVAULT_RECOVERY_MODE")]
    recovery_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut settings = if args.config.exists() {
        ServerSettings::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        ServerSettings::default()
    };
    if !args.drives.is_empty() {
        settings.drives = args.drives.clone();
    }
    settings.recovery_mode |= args.recovery_mode;

    info!("Starting RaidVault {}", env!("CARGO_PKG_VERSION"));
    info!("  Server: {}", settings.server_name);
    info!("  Redundancy: {}", settings.redundancy_level);
    info!("  Drives: {:?}", settings.drives);
    info!("  Version control: {}", settings.version_control);
    info!("  Encryption: {}", settings.encryption.enabled);

    // Opening blocks on drive I/O and journal recovery
    let vfs = tokio::task::spawn_blocking(move || VirtualFileSystem::open(settings))
        .await
        .context("startup task failed")?
        .map_err(|e| {
            error!("Startup failed: {}", e);
            e
        })?;

    let handles = vfs.start_background();
    info!("RaidVault ready with {} buckets", vfs.list_buckets().len());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    vfs.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    info!("RaidVault shutdown complete");
    Ok(())
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

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
