//! Electronic load commands

use std::time::Duration;

use anyhow::{Context, Result};
use bench_comlink::models::{ChannelLoadConfig, LoadMode, LoadSnapshot};
use clap::Subcommand;
use colored::*;

use crate::{monitor, Console};

#[derive(Subcommand)]
pub enum LoadCommands {
    /// Read the firmware version
    Version,

    /// Read voltage, current and status of all channels
    Status,

    /// Read the configuration of all channels
    Configs,

    /// Configure one channel
    #[command(about = "Set mode, on-voltage and set-point of one channel")]
    SetChannel {
        /// Channel 1-8
        index: u8,
        /// cc-slow | cv | cp | cr | cc-fast
        mode: LoadMode,
        /// On-voltage, V
        on_voltage: f64,
        /// Set-point in the mode's unit (A, V, W or Ohm)
        set_point: f64,
        /// Auxiliary delay parameter
        #[arg(long, default_value_t = 0)]
        delay: u8,
        /// Store in the device's non-volatile memory
        #[arg(long)]
        persist: bool,
    },

    /// Set the overall output voltage
    SetVoltage {
        /// Volts, within the configured limits
        volts: f64,
        /// Send to every unit on the bus (no reply)
        #[arg(long)]
        broadcast: bool,
    },

    /// Print live status until Ctrl-C
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

pub async fn handle_command(cmd: LoadCommands, console: &Console) -> Result<()> {
    let manager = &console.manager;
    let cancel = &console.cancel;
    let addr = console.load_address;

    let version = manager
        .connect_load(&console.load_transport, addr, console.deadline, cancel)
        .await?;
    println!(
        "{} load #{} on {} (firmware {})",
        "Connected:".bright_green(),
        addr,
        console.load_transport,
        version
    );
    let load = manager.load();

    match cmd {
        LoadCommands::Version => {
            println!("Version: {}", version.bright_cyan());
        },
        LoadCommands::Status => {
            let snapshot = load.read_status(addr, cancel).await?;
            print_snapshot(&snapshot);
        },
        LoadCommands::Configs => {
            let configs = load.read_channel_configs(addr, cancel).await?;
            println!(
                "{:>3}  {:<8} {:>10} {:>12} {:>6}",
                "CH".bold(),
                "MODE".bold(),
                "VON (V)".bold(),
                "SET-POINT".bold(),
                "DELAY".bold()
            );
            for cfg in configs {
                println!(
                    "{:>3}  {:<8} {:>10.2} {:>8.2} {:<3} {:>6}",
                    cfg.index,
                    cfg.mode.to_string(),
                    cfg.on_voltage,
                    cfg.set_point,
                    cfg.mode.unit(),
                    cfg.delay
                );
            }
        },
        LoadCommands::SetChannel {
            index,
            mode,
            on_voltage,
            set_point,
            delay,
            persist,
        } => {
            let cfg = ChannelLoadConfig::new(index, mode, on_voltage, set_point, delay);
            load.set_channel_config(addr, &cfg, persist, cancel)
                .await
                .with_context(|| format!("failed to configure channel {}", index))?;
            println!("{} channel {} set to {}", "OK".bright_green(), index, mode);
        },
        LoadCommands::SetVoltage { volts, broadcast } => {
            let target = if broadcast { 0x00 } else { addr };
            load.set_output_voltage(target, volts, cancel).await?;
            println!("{} output voltage {:.1} V", "OK".bright_green(), volts);
        },
        LoadCommands::Monitor { duration } => {
            println!("{}", "Monitoring, Ctrl-C to stop".dimmed());
            monitor::run(
                load.subscribe(),
                duration.map(Duration::from_secs),
                cancel,
                print_snapshot,
            )
            .await;
        },
    }
    Ok(())
}

fn print_snapshot(snapshot: &LoadSnapshot) {
    println!(
        "{} {}",
        "Snapshot".bold(),
        snapshot.captured_at.format("%H:%M:%S%.3f")
    );
    println!(
        "{:>3} {:>9} {:>8} {:>9} {:>7} {:>7}",
        "CH", "V", "A", "LLC V", "BITS", "ONLINE"
    );
    for ch in &snapshot.channels {
        let online = if ch.online {
            "yes".green()
        } else {
            "no".red()
        };
        println!(
            "{:>3} {:>9.2} {:>8.2} {:>9.2} {:>#7x} {:>7}",
            ch.index, ch.voltage, ch.current, ch.secondary_voltage, ch.status_bits, online
        );
    }
    let inverter = &snapshot.inverter;
    let summary = inverter.fault_summary();
    if inverter.has_fault() {
        println!("Inverter: {}", summary.red().bold());
    } else {
        println!("Inverter: {}", summary.green());
    }
}
