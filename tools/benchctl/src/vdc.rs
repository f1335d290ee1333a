//! Detection board commands

use std::time::Duration;

use anyhow::Result;
use bench_comlink::models::{DetectionChannel, DropStatus, IoCommand, IoStatus, VdcSnapshot};
use clap::Subcommand;
use colored::*;

use crate::{monitor, Console};

const OUTPUT_NAMES: [&str; 4] = ["PTC", "AC", "PSON", "FAN"];

#[derive(Subcommand)]
pub enum VdcCommands {
    /// Read the firmware version
    Version,

    /// Read voltage and drop status of all 32 channels
    Channels,

    /// Read the I/O status word and direction register
    Io,

    /// Drive one output
    SetIo {
        /// ptc-on | ptc-off | ac-on | ac-off | pson-on | pson-off | fan-on | fan-off
        command: IoCommand,
    },

    /// Read the drop thresholds
    Thresholds,

    /// Write drop thresholds starting at channel 1
    SetThresholds {
        /// Volts per channel, up to 32 values
        #[arg(required = true, num_args = 1..=32)]
        volts: Vec<f64>,
    },

    /// Clear all latched drop flags
    ClearFlags,

    /// Read the serial number
    Serial,

    /// Write the serial number
    SetSerial {
        /// ASCII, up to 62 characters
        serial: String,
    },

    /// Change the board's slave address
    SetAddress {
        /// New address 1-247
        address: u8,
    },

    /// Read the baud rate, or write it with --set
    Baud {
        /// New baud rate
        #[arg(long)]
        set: Option<u32>,
        /// Write to every board on the bus (no reply)
        #[arg(long, requires = "set")]
        broadcast: bool,
    },

    /// Read temperature, fan current and the AC dependency flag
    Env {
        /// Enable or disable "AC on depends on jig"
        #[arg(long)]
        ac_dependency: Option<bool>,
    },

    /// Print live channel data until Ctrl-C
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

pub async fn handle_command(cmd: VdcCommands, console: &Console) -> Result<()> {
    let manager = &console.manager;
    let cancel = &console.cancel;

    let version = manager
        .connect_detection_board(&console.vdc_transport, console.vdc_slave, console.deadline, cancel)
        .await?;
    println!(
        "{} VDC-32 slave {} on {} (firmware {})",
        "Connected:".bright_green(),
        console.vdc_slave,
        console.vdc_transport,
        version
    );
    let vdc = manager.detection_board();

    match cmd {
        VdcCommands::Version => println!("Version: {}", version.bright_cyan()),
        VdcCommands::Channels => {
            let channels = vdc.read_channels(cancel).await?;
            print_channels(&channels);
        },
        VdcCommands::Io => {
            let io = vdc.read_io_status(cancel).await?;
            let direction = vdc.read_io_direction(cancel).await?;
            print_io(&io);
            println!("Direction: {:#06x}", direction);
        },
        VdcCommands::SetIo { command } => {
            vdc.set_io_output(command, cancel).await?;
            println!("{} {:?}", "OK".bright_green(), command);
        },
        VdcCommands::Thresholds => {
            let thresholds = vdc.read_thresholds(cancel).await?;
            for (row, chunk) in thresholds.chunks(8).enumerate() {
                let line: Vec<String> = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, v)| format!("{:>2}:{:>6.2}", row * 8 + i + 1, v))
                    .collect();
                println!("{}", line.join("  "));
            }
        },
        VdcCommands::SetThresholds { volts } => {
            vdc.set_thresholds(&volts, cancel).await?;
            println!("{} {} thresholds written", "OK".bright_green(), volts.len());
        },
        VdcCommands::ClearFlags => {
            vdc.clear_drop_flags(cancel).await?;
            println!("{} drop flags cleared", "OK".bright_green());
        },
        VdcCommands::Serial => {
            let serial = vdc.read_serial_number(cancel).await?;
            println!("Serial: {}", serial.bright_cyan());
        },
        VdcCommands::SetSerial { serial } => {
            vdc.set_serial_number(&serial, cancel).await?;
            println!("{} serial number set", "OK".bright_green());
        },
        VdcCommands::SetAddress { address } => {
            vdc.set_slave_address(address, cancel).await?;
            println!("{} slave address is now {}", "OK".bright_green(), address);
        },
        VdcCommands::Baud { set, broadcast } => match set {
            None => println!("Baud rate: {}", vdc.read_baud_rate(cancel).await?),
            Some(baud) if broadcast => {
                vdc.broadcast_baud_rate(baud, cancel).await?;
                println!("{} baud {} broadcast", "OK".bright_green(), baud);
            },
            Some(baud) => {
                vdc.set_baud_rate(baud, cancel).await?;
                println!("{} baud rate {}", "OK".bright_green(), baud);
            },
        },
        VdcCommands::Env { ac_dependency } => {
            if let Some(enabled) = ac_dependency {
                vdc.set_ac_dependency(enabled, cancel).await?;
            }
            let env = vdc.read_environment(cancel).await?;
            println!("Temperature:    {:.0} °C", env.temperature);
            println!("Fan current:    {} mA", env.fan_current_ma);
            println!(
                "AC needs jig:   {}",
                if env.ac_depends_on_jig { "yes" } else { "no" }
            );
        },
        VdcCommands::Monitor { duration } => {
            println!("{}", "Monitoring, Ctrl-C to stop".dimmed());
            monitor::run(
                vdc.subscribe(),
                duration.map(Duration::from_secs),
                cancel,
                print_snapshot,
            )
            .await;
        },
    }
    Ok(())
}

fn status_text(status: DropStatus) -> ColoredString {
    match status {
        DropStatus::Ok => status.to_string().green(),
        DropStatus::Dropped => status.to_string().red().bold(),
        DropStatus::Flagged => status.to_string().yellow(),
    }
}

fn print_channels(channels: &[DetectionChannel]) {
    for pair in channels.chunks(2) {
        let cells: Vec<String> = pair
            .iter()
            .map(|ch| {
                format!(
                    "{:>2}  {:>7.3} V  {:<8} {:>5}",
                    ch.channel,
                    ch.voltage,
                    status_text(ch.status),
                    ch.recovery_time
                )
            })
            .collect();
        println!("{}", cells.join("    "));
    }
}

fn print_io(io: &IoStatus) {
    let outputs: Vec<String> = OUTPUT_NAMES
        .iter()
        .zip(io.outputs.iter())
        .map(|(name, on)| format!("{}={}", name, if *on { "ON" } else { "off" }))
        .collect();
    println!("I/O word: {:#06x}  outputs: {}", io.raw, outputs.join(" "));
    let flag = |set: bool| if set { "yes".yellow() } else { "no".normal() };
    println!(
        "S1 {}  leak(self) {}  leak(parallel) {}  jig {}  contactor {}  fan {}  AC-needs-jig {}",
        flag(io.s1_switch),
        flag(io.water_leak_self),
        flag(io.water_leak_parallel),
        flag(io.jig_in_place),
        flag(io.contactor),
        flag(io.fan_running),
        flag(io.ac_on_depends_on_jig)
    );
}

fn print_snapshot(snapshot: &VdcSnapshot) {
    println!(
        "{} {}",
        "Snapshot".bold(),
        snapshot.captured_at.format("%H:%M:%S%.3f")
    );
    print_channels(&snapshot.channels);
    print_io(&snapshot.io);
}
