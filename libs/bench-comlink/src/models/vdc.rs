//! Voltage-drop detection board (VDC-32) models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

pub const CHANNEL_COUNT: usize = 32;
pub const DROP_FLAG_WORDS: usize = 2;
pub const SERIAL_NUMBER_WORDS: usize = 31;
/// Threshold registers hold hundredths of a volt
pub const THRESHOLD_SCALE: f64 = 100.0;

/// Holding register map
pub mod reg {
    pub const SLAVE_ADDRESS: u16 = 0x8000;
    pub const VERSION: u16 = 0x8001;
    pub const BAUD_RATE: u16 = 0x8002;
    pub const IO_DIRECTION: u16 = 0x8003;
    pub const IO_STATUS: u16 = 0x8004;
    pub const DROP_FLAGS: u16 = 0x8005;
    pub const TEMPERATURE: u16 = 0x8008;
    pub const FAN_CURRENT: u16 = 0x8009;
    pub const AC_DEPENDENCY: u16 = 0x800A;
    pub const VOLTAGES: u16 = 0x8010;
    pub const RECOVERY_TIMES: u16 = 0x8030;
    pub const THRESHOLDS: u16 = 0x8050;
    pub const SERIAL_NUMBER: u16 = 0x8820;
}

/// Voltage register to volts
///
/// Values above 0x8000 carry hundredths of a volt in the low 15 bits,
/// everything else is millivolts.
pub fn scale_voltage(raw: u16) -> f64 {
    if raw > 0x8000 {
        f64::from(raw - 0x8000) / 100.0
    } else {
        f64::from(raw) / 1000.0
    }
}

/// Version register to "major.minor" text
pub fn format_version(raw: u16) -> String {
    format!("{:.1}", f64::from(raw) / 10.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropStatus {
    Ok,
    /// Drop flag set and no recovery recorded
    Dropped,
    /// Drop flag set but the channel has since recovered
    Flagged,
}

impl fmt::Display for DropStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropStatus::Ok => "OK",
            DropStatus::Dropped => "DROPPED",
            DropStatus::Flagged => "FLAGGED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionChannel {
    /// 1-based channel number
    pub channel: u8,
    pub voltage: f64,
    pub status: DropStatus,
    pub recovery_time: u16,
}

/// Combine the voltage, recovery-timer and drop-flag reads into channel records
pub fn build_channels(
    voltages: &[u16],
    recovery_times: &[u16],
    drop_flags: &[u16],
) -> Result<Vec<DetectionChannel>> {
    if voltages.len() < CHANNEL_COUNT
        || recovery_times.len() < CHANNEL_COUNT
        || drop_flags.len() < DROP_FLAG_WORDS
    {
        return Err(LinkError::unexpected(format!(
            "channel data incomplete: {} voltages, {} timers, {} flag words",
            voltages.len(),
            recovery_times.len(),
            drop_flags.len()
        )));
    }

    Ok((0..CHANNEL_COUNT)
        .map(|i| {
            let flagged = (drop_flags[i / 16] >> (i % 16)) & 1 != 0;
            let status = match (flagged, recovery_times[i]) {
                (false, _) => DropStatus::Ok,
                (true, 0) => DropStatus::Dropped,
                (true, _) => DropStatus::Flagged,
            };
            DetectionChannel {
                channel: i as u8 + 1,
                voltage: scale_voltage(voltages[i]),
                status,
                recovery_time: recovery_times[i],
            }
        })
        .collect())
}

/// Decoded I/O status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStatus {
    pub raw: u16,
    /// Output bits 0-7; set means the output is driven low (active).
    /// Bits 0-3 drive PTC, AC, PSON and FAN.
    pub outputs: [bool; 8],
    pub s1_switch: bool,
    pub water_leak_self: bool,
    pub water_leak_parallel: bool,
    pub jig_in_place: bool,
    pub contactor: bool,
    pub fan_running: bool,
    pub ac_on_depends_on_jig: bool,
}

impl From<u16> for IoStatus {
    fn from(raw: u16) -> Self {
        let mut outputs = [false; 8];
        for (bit, output) in outputs.iter_mut().enumerate() {
            *output = raw & (1 << bit) != 0;
        }
        Self {
            raw,
            outputs,
            s1_switch: raw & 0x0100 != 0,
            water_leak_self: raw & 0x0200 != 0,
            water_leak_parallel: raw & 0x0400 != 0,
            jig_in_place: raw & 0x0800 != 0,
            contactor: raw & 0x1000 != 0,
            fan_running: raw & 0x2000 != 0,
            ac_on_depends_on_jig: raw & 0x4000 != 0,
        }
    }
}

/// Output commands written to the I/O register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCommand {
    PtcOn,
    PtcOff,
    AcOn,
    AcOff,
    PsonOn,
    PsonOff,
    FanOn,
    FanOff,
}

impl IoCommand {
    pub fn code(self) -> u16 {
        match self {
            IoCommand::PtcOn => 0x0100,
            IoCommand::PtcOff => 0x0101,
            IoCommand::AcOn => 0x0200,
            IoCommand::AcOff => 0x0201,
            IoCommand::PsonOn => 0x0400,
            IoCommand::PsonOff => 0x0401,
            IoCommand::FanOn => 0x0800,
            IoCommand::FanOff => 0x0801,
        }
    }
}

impl FromStr for IoCommand {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ptc-on" => Ok(IoCommand::PtcOn),
            "ptc-off" => Ok(IoCommand::PtcOff),
            "ac-on" => Ok(IoCommand::AcOn),
            "ac-off" => Ok(IoCommand::AcOff),
            "pson-on" => Ok(IoCommand::PsonOn),
            "pson-off" => Ok(IoCommand::PsonOff),
            "fan-on" => Ok(IoCommand::FanOn),
            "fan-off" => Ok(IoCommand::FanOff),
            other => Err(LinkError::validation(format!("unknown I/O command '{}'", other))),
        }
    }
}

/// Thermal and fan telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VdcEnvironment {
    pub temperature: f64,
    pub fan_current_ma: u16,
    pub ac_depends_on_jig: bool,
}

/// One poll of the detection board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VdcSnapshot {
    pub channels: Vec<DetectionChannel>,
    pub io: IoStatus,
    pub captured_at: DateTime<Utc>,
}

/// Threshold registers to volts
pub fn thresholds_from_registers(registers: &[u16]) -> Vec<f64> {
    registers
        .iter()
        .map(|&raw| f64::from(raw) / THRESHOLD_SCALE)
        .collect()
}

/// Volts to threshold registers, range-checked
pub fn thresholds_to_registers(thresholds: &[f64]) -> Result<Vec<u16>> {
    if thresholds.is_empty() || thresholds.len() > CHANNEL_COUNT {
        return Err(LinkError::validation(format!(
            "threshold count {} outside 1..={}",
            thresholds.len(),
            CHANNEL_COUNT
        )));
    }
    let max = f64::from(u16::MAX) / THRESHOLD_SCALE;
    thresholds
        .iter()
        .enumerate()
        .map(|(i, &volts)| {
            if !volts.is_finite() || !(0.0..=max).contains(&volts) {
                return Err(LinkError::validation(format!(
                    "threshold {} of channel {} outside 0..={:.2} V",
                    volts,
                    i + 1,
                    max
                )));
            }
            Ok((volts * THRESHOLD_SCALE).round() as u16)
        })
        .collect()
}

/// ASCII serial number packed two characters per register, high byte first
pub fn serial_number_to_registers(serial: &str) -> Result<Vec<u16>> {
    if serial.is_empty() {
        return Err(LinkError::validation("serial number cannot be empty"));
    }
    if !serial.is_ascii() {
        return Err(LinkError::validation("serial number must be ASCII"));
    }
    let bytes = serial.as_bytes();
    if bytes.len() > SERIAL_NUMBER_WORDS * 2 {
        return Err(LinkError::validation(format!(
            "serial number longer than {} characters",
            SERIAL_NUMBER_WORDS * 2
        )));
    }
    let mut registers = vec![0u16; SERIAL_NUMBER_WORDS];
    for (register, pair) in registers.iter_mut().zip(bytes.chunks(2)) {
        let hi = pair[0];
        let lo = pair.get(1).copied().unwrap_or(0);
        *register = u16::from_be_bytes([hi, lo]);
    }
    Ok(registers)
}

pub fn serial_number_from_registers(registers: &[u16]) -> String {
    let bytes: Vec<u8> = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string()
}
