//! Electronic load (GJDD-750) models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

pub const CHANNEL_COUNT: usize = 8;
/// Bytes per channel configuration record
pub const CONFIG_RECORD_LEN: usize = 6;
/// Bytes per channel status record
pub const STATUS_RECORD_LEN: usize = 8;
/// Eight status records plus the inverter byte
pub const STATUS_INFO_LEN: usize = CHANNEL_COUNT * STATUS_RECORD_LEN + 1;
pub const VERSION_MAX_LEN: usize = 10;
pub const UNKNOWN_VERSION: &str = "unknown";

/// Voltages on the wire are 1/20 V
pub const VOLTAGE_SCALE: f64 = 20.0;
/// Currents on the wire are 1/100 A
pub const CURRENT_SCALE: f64 = 100.0;

pub fn validate_channel_index(index: u8) -> Result<()> {
    if !(1..=CHANNEL_COUNT as u8).contains(&index) {
        return Err(LinkError::validation(format!(
            "channel index {} outside 1..={}",
            index, CHANNEL_COUNT
        )));
    }
    Ok(())
}

fn scale_to_u16(value: f64, scale: f64, field: &str) -> Result<u16> {
    if !value.is_finite() || value < 0.0 {
        return Err(LinkError::validation(format!(
            "{} must be a non-negative number, got {}",
            field, value
        )));
    }
    let raw = (value * scale).round();
    if raw > f64::from(u16::MAX) {
        return Err(LinkError::validation(format!(
            "{} {} exceeds the encodable maximum {:.2}",
            field,
            value,
            f64::from(u16::MAX) / scale
        )));
    }
    Ok(raw as u16)
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Operating mode of a load channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    /// Constant current, slow slew
    CcSlow = 0,
    /// Constant voltage
    Cv = 1,
    /// Constant power
    Cp = 2,
    /// Constant resistance
    Cr = 3,
    /// Constant current, fast slew
    CcFast = 4,
}

impl LoadMode {
    /// Wire units per engineering unit of the set-point
    pub fn set_point_scale(self) -> f64 {
        match self {
            LoadMode::CcSlow | LoadMode::CcFast => 100.0,
            LoadMode::Cv => 20.0,
            LoadMode::Cp | LoadMode::Cr => 10.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            LoadMode::CcSlow | LoadMode::CcFast => "A",
            LoadMode::Cv => "V",
            LoadMode::Cp => "W",
            LoadMode::Cr => "Ohm",
        }
    }
}

impl TryFrom<u8> for LoadMode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LoadMode::CcSlow),
            1 => Ok(LoadMode::Cv),
            2 => Ok(LoadMode::Cp),
            3 => Ok(LoadMode::Cr),
            4 => Ok(LoadMode::CcFast),
            other => Err(LinkError::unexpected(format!("unknown load mode {}", other))),
        }
    }
}

impl FromStr for LoadMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "cc-slow" | "cc" => Ok(LoadMode::CcSlow),
            "cv" => Ok(LoadMode::Cv),
            "cp" => Ok(LoadMode::Cp),
            "cr" => Ok(LoadMode::Cr),
            "cc-fast" => Ok(LoadMode::CcFast),
            other => Err(LinkError::validation(format!("unknown load mode '{}'", other))),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadMode::CcSlow => "CC-slow",
            LoadMode::Cv => "CV",
            LoadMode::Cp => "CP",
            LoadMode::Cr => "CR",
            LoadMode::CcFast => "CC-fast",
        };
        f.write_str(name)
    }
}

/// Configuration of one load channel
///
/// Wire record: `mode, von_hi, von_lo, load_hi, load_lo, delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLoadConfig {
    /// 1-based channel index
    pub index: u8,
    pub mode: LoadMode,
    /// Voltage at which the channel starts sinking, volts
    pub on_voltage: f64,
    /// Set-point in the mode's unit
    pub set_point: f64,
    /// Auxiliary delay parameter, device units
    pub delay: u8,
}

impl ChannelLoadConfig {
    pub fn new(index: u8, mode: LoadMode, on_voltage: f64, set_point: f64, delay: u8) -> Self {
        Self {
            index,
            mode,
            on_voltage,
            set_point,
            delay,
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; CONFIG_RECORD_LEN]> {
        validate_channel_index(self.index)?;
        let von = scale_to_u16(self.on_voltage, VOLTAGE_SCALE, "on-voltage")?;
        let load = scale_to_u16(self.set_point, self.mode.set_point_scale(), "set-point")?;
        let [von_hi, von_lo] = von.to_be_bytes();
        let [load_hi, load_lo] = load.to_be_bytes();
        Ok([self.mode as u8, von_hi, von_lo, load_hi, load_lo, self.delay])
    }

    pub fn from_bytes(index: u8, record: &[u8]) -> Result<Self> {
        if record.len() < CONFIG_RECORD_LEN {
            return Err(LinkError::unexpected(format!(
                "channel config record of {} bytes",
                record.len()
            )));
        }
        let mode = LoadMode::try_from(record[0])?;
        Ok(Self {
            index,
            mode,
            on_voltage: f64::from(be_u16(record, 1)) / VOLTAGE_SCALE,
            set_point: f64::from(be_u16(record, 3)) / mode.set_point_scale(),
            delay: record[5],
        })
    }
}

/// Parse the read-all-configs info block
pub fn parse_channel_configs(info: &[u8]) -> Result<Vec<ChannelLoadConfig>> {
    let needed = CHANNEL_COUNT * CONFIG_RECORD_LEN;
    if info.len() < needed {
        return Err(LinkError::unexpected(format!(
            "config block of {} bytes, expected {}",
            info.len(),
            needed
        )));
    }
    info[..needed]
        .chunks_exact(CONFIG_RECORD_LEN)
        .enumerate()
        .map(|(i, record)| ChannelLoadConfig::from_bytes(i as u8 + 1, record))
        .collect()
}

/// Encode all eight channels for a batch set, ordered by index
pub fn encode_all_configs(configs: &[ChannelLoadConfig]) -> Result<Vec<u8>> {
    if configs.len() != CHANNEL_COUNT {
        return Err(LinkError::validation(format!(
            "batch set needs {} channels, got {}",
            CHANNEL_COUNT,
            configs.len()
        )));
    }
    let mut sorted: Vec<&ChannelLoadConfig> = configs.iter().collect();
    sorted.sort_by_key(|cfg| cfg.index);
    for (expected, cfg) in (1..=CHANNEL_COUNT as u8).zip(&sorted) {
        if cfg.index != expected {
            return Err(LinkError::validation(format!(
                "batch set needs each channel 1..={} exactly once",
                CHANNEL_COUNT
            )));
        }
    }
    let mut info = Vec::with_capacity(CHANNEL_COUNT * CONFIG_RECORD_LEN);
    for cfg in sorted {
        info.extend_from_slice(&cfg.to_bytes()?);
    }
    Ok(info)
}

/// ASCII firmware version, NUL padding trimmed
pub fn parse_version(info: &[u8]) -> String {
    let take = info.len().min(VERSION_MAX_LEN);
    let text = String::from_utf8_lossy(&info[..take]);
    let text = text.trim_end_matches('\0').trim();
    if text.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        text.to_string()
    }
}

/// Real-time readings of one load channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadChannelStatus {
    pub index: u8,
    pub voltage: f64,
    pub current: f64,
    /// LLC stage voltage
    pub secondary_voltage: f64,
    pub status_bits: u16,
    pub online: bool,
}

impl LoadChannelStatus {
    fn from_record(index: u8, record: &[u8]) -> Self {
        Self {
            index,
            voltage: f64::from(be_u16(record, 0)) / VOLTAGE_SCALE,
            current: f64::from(be_u16(record, 2)) / CURRENT_SCALE,
            secondary_voltage: f64::from(be_u16(record, 4)) / VOLTAGE_SCALE,
            status_bits: be_u16(record, 6),
            online: record[7] & 0x01 != 0,
        }
    }
}

/// Two-bit voltage condition reported by the inverter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageLevel {
    Under,
    Normal,
    Over,
    Invalid,
}

impl From<u8> for VoltageLevel {
    fn from(bits: u8) -> Self {
        match bits & 0x03 {
            0 => VoltageLevel::Under,
            1 => VoltageLevel::Normal,
            2 => VoltageLevel::Over,
            _ => VoltageLevel::Invalid,
        }
    }
}

/// Inverter status byte
///
/// ```text
/// bit 0    over-temperature
/// bit 1    AD sampling fault
/// bit 2-3  output voltage level
/// bit 4    fan fault
/// bit 5    communication timeout
/// bit 6-7  DC bus voltage level
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverterStatus {
    pub raw: u8,
    pub over_temperature: bool,
    pub ad_fault: bool,
    pub output_voltage: VoltageLevel,
    pub fan_fault: bool,
    pub comm_timeout: bool,
    pub dc_bus_voltage: VoltageLevel,
}

impl InverterStatus {
    pub fn from_byte(raw: u8) -> Self {
        Self {
            raw,
            over_temperature: raw & 0x01 != 0,
            ad_fault: raw & 0x02 != 0,
            output_voltage: VoltageLevel::from(raw >> 2),
            fan_fault: raw & 0x10 != 0,
            comm_timeout: raw & 0x20 != 0,
            dc_bus_voltage: VoltageLevel::from(raw >> 6),
        }
    }

    pub fn has_fault(&self) -> bool {
        self.over_temperature
            || self.ad_fault
            || self.fan_fault
            || self.comm_timeout
            || self.output_voltage != VoltageLevel::Normal
            || self.dc_bus_voltage != VoltageLevel::Normal
    }

    /// Active conditions joined with ", ", or "normal"
    pub fn fault_summary(&self) -> String {
        if !self.has_fault() {
            return "normal".to_string();
        }
        let mut faults = Vec::new();
        if self.over_temperature {
            faults.push("over-temperature");
        }
        if self.ad_fault {
            faults.push("AD fault");
        }
        if self.fan_fault {
            faults.push("fan fault");
        }
        if self.comm_timeout {
            faults.push("communication timeout");
        }
        if self.output_voltage != VoltageLevel::Normal {
            faults.push("output voltage abnormal");
        }
        if self.dc_bus_voltage != VoltageLevel::Normal {
            faults.push("DC bus voltage abnormal");
        }
        faults.join(", ")
    }
}

/// One real-time status read of the load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub channels: Vec<LoadChannelStatus>,
    pub inverter: InverterStatus,
    pub captured_at: DateTime<Utc>,
}

impl LoadSnapshot {
    pub fn parse(info: &[u8]) -> Result<Self> {
        if info.len() < STATUS_INFO_LEN {
            return Err(LinkError::unexpected(format!(
                "status block of {} bytes, expected {}",
                info.len(),
                STATUS_INFO_LEN
            )));
        }
        let channels = info[..CHANNEL_COUNT * STATUS_RECORD_LEN]
            .chunks_exact(STATUS_RECORD_LEN)
            .enumerate()
            .map(|(i, record)| LoadChannelStatus::from_record(i as u8 + 1, record))
            .collect();
        Ok(Self {
            channels,
            inverter: InverterStatus::from_byte(info[CHANNEL_COUNT * STATUS_RECORD_LEN]),
            captured_at: Utc::now(),
        })
    }
}
