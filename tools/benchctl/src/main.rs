//! benchctl - operator console for the bench instruments
//!
//! Connects to the GJDD-750 electronic load or the VDC-32 voltage-drop
//! detection board over serial or TCP, runs one command and disconnects.

mod config;
mod load;
mod monitor;
mod vdc;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use bench_comlink::{ConnectionManager, TransportConfig, DEFAULT_CONNECT_DEADLINE};
use clap::{Parser, Subcommand};
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConsoleConfig, TransportArgs};

#[derive(Parser)]
#[command(name = "benchctl")]
#[command(about = "Bench instrument console for the electronic load and the detection board")]
#[command(long_about = "Bench instrument console for the electronic load and the detection board

Device Commands:
  load        GJDD-750 electronic load (version, status, channel setup, output voltage)
  vdc         VDC-32 voltage-drop detection board (channels, I/O, thresholds, identity)
  config      Show the effective configuration

Examples:
  benchctl load status                          # One status read over the configured link
  benchctl --transport tcp --host 10.0.0.5 vdc channels
  benchctl load set-channel 3 cv 400 350 --persist
  benchctl vdc monitor --duration 30            # Live view for 30 seconds

Use 'benchctl <command> --help' for more information on a specific command.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./benchctl.yaml when present)
    #[arg(short = 'c', long, global = true, env = "BENCHCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `bench_comlink=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Connect deadline in milliseconds
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    #[command(flatten)]
    link: TransportArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Electronic load commands
    #[command(about = "Talk to the GJDD-750 electronic load")]
    Load {
        #[command(subcommand)]
        command: load::LoadCommands,
    },

    /// Detection board commands
    #[command(about = "Talk to the VDC-32 voltage-drop detection board")]
    Vdc {
        #[command(subcommand)]
        command: vdc::VdcCommands,
    },

    /// Configuration inspection
    #[command(about = "Show the effective or default configuration")]
    Config {
        #[command(subcommand)]
        command: config::ConfigCommands,
    },
}

/// Everything a device command needs
pub struct Console {
    pub manager: ConnectionManager,
    pub load_transport: TransportConfig,
    pub load_address: u8,
    pub vdc_transport: TransportConfig,
    pub vdc_slave: u8,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl Console {
    fn new(config: &ConsoleConfig, cli: &Cli) -> Self {
        Self {
            manager: ConnectionManager::new(
                config.load.session.clone(),
                config.vdc.session.clone(),
                config.load.limits,
            ),
            load_transport: cli.link.resolve(&config.load.link),
            load_address: cli.link.address.unwrap_or(config.load.address),
            vdc_transport: cli.link.resolve(&config.vdc.link),
            vdc_slave: cli.link.address.unwrap_or(config.vdc.slave_id),
            deadline: cli
                .connect_timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_DEADLINE),
            cancel: CancellationToken::new(),
        }
    }
}

/// Cancel in-flight work on Ctrl-C
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                debug!("interrupt received");
                cancel.cancel();
            },
            Err(e) => warn!("Ctrl-C handler unavailable: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let mut config = ConsoleConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    let log_guard = common::logging::init_logging(&config.log_config(!cli.no_color))?;

    let console = Console::new(&config, &cli);
    spawn_interrupt_handler(console.cancel.clone());

    let result = match cli.command {
        Commands::Load { command } => load::handle_command(command, &console).await,
        Commands::Vdc { command } => vdc::handle_command(command, &console).await,
        Commands::Config { command } => config::handle_command(command, &config),
    };

    console.manager.disconnect_all().await;

    if let Err(e) = &result {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
