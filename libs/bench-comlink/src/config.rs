//! Transport and session configuration
//!
//! Plain serde structs; loading and layering is the caller's job.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

pub const DEFAULT_SERIAL_PORT: &str = "COM1";
pub const DEFAULT_BAUD_RATE: u32 = 57600;
pub const DEFAULT_TCP_HOST: &str = "192.168.1.100";
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Serial line settings; framing is fixed at 8N1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Quiet gap that ends a response
    pub settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 2000,
            write_timeout_ms: 1000,
            settle_ms: 20,
        }
    }
}

/// TCP endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Quiet gap that ends a response
    pub settle_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_TCP_HOST.to_string(),
            port: DEFAULT_TCP_PORT,
            connect_timeout_ms: 3000,
            receive_timeout_ms: 3000,
            settle_ms: 20,
        }
    }
}

/// Transport selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Tcp(TcpConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Serial(SerialConfig::default())
    }
}

impl TransportConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        match self {
            TransportConfig::Serial(cfg) => {
                if cfg.port.trim().is_empty() {
                    return Err(LinkError::config("serial port name cannot be empty"));
                }
                if cfg.baud_rate == 0 {
                    return Err(LinkError::config("baud rate must be greater than zero"));
                }
                if cfg.read_timeout_ms == 0 || cfg.write_timeout_ms == 0 {
                    return Err(LinkError::config("serial timeouts must be greater than zero"));
                }
            },
            TransportConfig::Tcp(cfg) => {
                if cfg.host.trim().is_empty() {
                    return Err(LinkError::config("host cannot be empty"));
                }
                if cfg.port == 0 {
                    return Err(LinkError::config("TCP port must be greater than zero"));
                }
                if cfg.connect_timeout_ms == 0 || cfg.receive_timeout_ms == 0 {
                    return Err(LinkError::config("TCP timeouts must be greater than zero"));
                }
            },
        }
        Ok(())
    }

    /// Per-exchange response deadline
    pub fn response_timeout(&self) -> Duration {
        match self {
            TransportConfig::Serial(cfg) => Duration::from_millis(cfg.read_timeout_ms),
            TransportConfig::Tcp(cfg) => Duration::from_millis(cfg.receive_timeout_ms),
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Serial(cfg) => write!(f, "{}@{}", cfg.port, cfg.baud_rate),
            TransportConfig::Tcp(cfg) => write!(f, "{}:{}", cfg.host, cfg.port),
        }
    }
}

/// Poll cadence and liveness settings of one device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    /// Starvation threshold of the watchdog
    pub watchdog_timeout_ms: u64,
    pub watchdog_check_interval_ms: u64,
}

impl SessionConfig {
    /// Load device: poll once per second
    pub fn load_device() -> Self {
        Self {
            poll_interval_ms: 1000,
            ..Self::default()
        }
    }

    /// Detection board: poll twice per second
    pub fn detection_board() -> Self {
        Self {
            poll_interval_ms: 500,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn watchdog_check_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(LinkError::config("poll interval must be greater than zero"));
        }
        if self.watchdog_timeout_ms == 0 || self.watchdog_check_interval_ms == 0 {
            return Err(LinkError::config("watchdog intervals must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            watchdog_timeout_ms: 5000,
            watchdog_check_interval_ms: 1000,
        }
    }
}

/// Accepted output-voltage range of the load device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadLimits {
    pub min_output_voltage: f64,
    pub max_output_voltage: f64,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            min_output_voltage: 300.0,
            max_output_voltage: 800.0,
        }
    }
}
