//! Console configuration
//!
//! Priority: command-line overrides > `BENCHCTL_*` environment > config file > defaults

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bench_comlink::config::{SerialConfig, TcpConfig};
use bench_comlink::{LoadLimits, SessionConfig, TransportConfig};
use clap::{Args, Subcommand, ValueEnum};
use common::logging::LogConfig;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "BENCHCTL_";
pub const DEFAULT_CONFIG_FILE: &str = "benchctl.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Serial,
    Tcp,
}

/// Both transports side by side, `kind` picks one
///
/// Layered sources merge field by field, so each transport keeps its own key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub kind: TransportKind,
    pub serial: SerialConfig,
    pub tcp: TcpConfig,
}

impl LinkConfig {
    pub fn transport(&self) -> TransportConfig {
        match self.kind {
            TransportKind::Serial => TransportConfig::Serial(self.serial.clone()),
            TransportKind::Tcp => TransportConfig::Tcp(self.tcp.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadDeviceConfig {
    pub link: LinkConfig,
    pub address: u8,
    pub session: SessionConfig,
    pub limits: LoadLimits,
}

impl Default for LoadDeviceConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            address: 1,
            session: SessionConfig::load_device(),
            limits: LoadLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdcDeviceConfig {
    pub link: LinkConfig,
    pub slave_id: u8,
    pub session: SessionConfig,
}

impl Default for VdcDeviceConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            slave_id: 1,
            session: SessionConfig::detection_board(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily-rolling log files go here when set
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub load: LoadDeviceConfig,
    pub vdc: VdcDeviceConfig,
    pub logging: LoggingConfig,
}

impl ConsoleConfig {
    /// Load from an explicit file, or `benchctl.yaml` when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        let path = match path {
            Some(path) => Some(path),
            None if default_file.exists() => Some(default_file),
            None => None,
        };
        common::config_loader::load_layered(path, ENV_PREFIX).with_context(|| match path {
            Some(path) => format!("failed to load {}", path.display()),
            None => "failed to load configuration from the environment".to_string(),
        })
    }

    pub fn log_config(&self, ansi: bool) -> LogConfig {
        LogConfig {
            service_name: "benchctl".to_string(),
            level: self.logging.level.clone(),
            log_dir: self.logging.dir.clone(),
            json_file: self.logging.json,
            ansi,
        }
    }
}

/// Transport overrides shared by every device command
#[derive(Debug, Clone, Default, Args)]
pub struct TransportArgs {
    /// Transport to use instead of the configured one
    #[arg(long, global = true, value_enum)]
    pub transport: Option<TransportKind>,

    /// Serial port name
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    pub baud: Option<u32>,

    /// TCP host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// TCP port
    #[arg(long = "tcp-port", global = true)]
    pub tcp_port: Option<u16>,

    /// Device address (load) or slave id (detection board)
    #[arg(long, short = 'a', global = true)]
    pub address: Option<u8>,
}

impl TransportArgs {
    /// Resolve the transport for one device from its link settings
    pub fn resolve(&self, link: &LinkConfig) -> TransportConfig {
        let mut link = link.clone();
        if let Some(kind) = self.transport {
            link.kind = kind;
        }
        if let Some(port) = &self.port {
            link.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            link.serial.baud_rate = baud;
        }
        if let Some(host) = &self.host {
            link.tcp.host = host.clone();
        }
        if let Some(port) = self.tcp_port {
            link.tcp.port = port;
        }
        link.transport()
    }
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as YAML
    Show,
    /// Print the built-in defaults as YAML, a starting point for benchctl.yaml
    Defaults,
}

pub fn handle_command(cmd: ConfigCommands, config: &ConsoleConfig) -> Result<()> {
    let yaml = match cmd {
        ConfigCommands::Show => serde_yaml::to_string(config)?,
        ConfigCommands::Defaults => serde_yaml::to_string(&ConsoleConfig::default())?,
    };
    print!("{}", yaml);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "load:\n  address: 3\n  link:\n    kind: tcp\n    tcp:\n      host: 10.0.0.7\nvdc:\n  session:\n    poll_interval_ms: 250"
        )
        .unwrap();

        let config = ConsoleConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.load.address, 3);
        let TransportConfig::Tcp(tcp) = config.load.link.transport() else {
            panic!("expected tcp transport");
        };
        assert_eq!(tcp.host, "10.0.0.7");
        assert_eq!(tcp.port, 502);
        assert_eq!(config.vdc.session.poll_interval_ms, 250);
        assert_eq!(config.vdc.session.watchdog_timeout_ms, 5000);
        assert_eq!(config.load.session.poll_interval_ms, 1000);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(ConsoleConfig::load(Some(Path::new("/nonexistent/benchctl.yaml"))).is_err());
    }

    #[test]
    fn test_transport_overrides() {
        let link = LinkConfig::default();
        let args = TransportArgs {
            baud: Some(115_200),
            port: Some("/dev/ttyUSB0".to_string()),
            ..Default::default()
        };
        assert_eq!(args.resolve(&link).to_string(), "/dev/ttyUSB0@115200");

        let args = TransportArgs {
            transport: Some(TransportKind::Tcp),
            tcp_port: Some(4001),
            ..Default::default()
        };
        assert_eq!(args.resolve(&link).to_string(), "192.168.1.100:4001");
    }

    #[test]
    fn test_defaults_round_trip_through_yaml() {
        let yaml = serde_yaml::to_string(&ConsoleConfig::default()).unwrap();
        let parsed: ConsoleConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, ConsoleConfig::default());
    }
}
