//! Standalone runner for the hardware service.
//!
//! Brings up logging and the device manager, then waits for Ctrl-C. The
//! production deployment embeds the library behind its own application
//! layer; this binary exists for bench setups and field debugging.

use clap::Parser;
use tracing::info;

use pvsrv::utils::init_logger;
use pvsrv::{DeviceManager, ProfileStore, PvSrvConfig};

/// Command-line arguments for pvsrv
#[derive(Parser)]
#[command(
    name = "pvsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Solar/battery hardware abstraction service",
    long_about = None
)]
struct Args {
    /// Path to the service configuration file
    #[arg(short, long, default_value = "config/pvsrv.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files; console logging when omitted
    #[arg(long)]
    log_dir: Option<String>,

    /// Force simulation mode regardless of configuration
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match &args.log_dir {
        Some(dir) => init_logger(dir, "pvsrv", &args.log_level, false)?,
        None => init_logger("logs", "pvsrv", &args.log_level, true)?,
    }

    let mut config = PvSrvConfig::load(&args.config)?;
    if args.simulate {
        config.simulate_hardware = true;
    }

    let profiles = ProfileStore::load_dir(&config.profiles_dir)?;
    info!("Loaded {} device profiles", profiles.len());

    let manager = DeviceManager::new(config, profiles);
    manager.start().await;
    info!("pvsrv running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    manager.stop().await;
    Ok(())
}
