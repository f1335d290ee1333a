//! Connection orchestration
//!
//! Both instruments share one physical bus, so at most one session may be
//! connected at a time. Connecting one device first disconnects the other.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{LoadLimits, SessionConfig, TransportConfig};
use crate::error::{LinkError, Result};
use crate::session::{LoadSession, VdcSession};

/// Upper bound for transport open plus handshake
pub const DEFAULT_CONNECT_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Load,
    DetectionBoard,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Load => "load",
            DeviceKind::DetectionBoard => "detection board",
        })
    }
}

#[derive(Debug)]
pub struct ConnectionManager {
    load: LoadSession,
    vdc: VdcSession,
    sequence: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(load_config: SessionConfig, vdc_config: SessionConfig, limits: LoadLimits) -> Self {
        Self {
            load: LoadSession::new(load_config, limits),
            vdc: VdcSession::new(vdc_config),
            sequence: Mutex::new(()),
        }
    }

    pub fn load(&self) -> &LoadSession {
        &self.load
    }

    pub fn detection_board(&self) -> &VdcSession {
        &self.vdc
    }

    /// Which device currently holds the bus, if any
    pub fn active_device(&self) -> Option<DeviceKind> {
        if self.load.is_connected() {
            Some(DeviceKind::Load)
        } else if self.vdc.is_connected() {
            Some(DeviceKind::DetectionBoard)
        } else {
            None
        }
    }

    /// Connect the electronic load, releasing the detection board first
    pub async fn connect_load(
        &self,
        transport: &TransportConfig,
        address: u8,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let _sequence = self.sequence.lock().await;
        self.vdc.disconnect().await;
        self.load.disconnect().await;

        let result = with_deadline(deadline, self.load.connect(transport, address, cancel)).await;
        self.finish(DeviceKind::Load, transport, result).await
    }

    /// Connect the detection board, releasing the load first
    pub async fn connect_detection_board(
        &self,
        transport: &TransportConfig,
        slave: u8,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let _sequence = self.sequence.lock().await;
        self.load.disconnect().await;
        self.vdc.disconnect().await;

        let result = with_deadline(deadline, self.vdc.connect(transport, slave, cancel)).await;
        self.finish(DeviceKind::DetectionBoard, transport, result).await
    }

    pub async fn disconnect_all(&self) {
        let _sequence = self.sequence.lock().await;
        if self.vdc.is_connected() {
            self.vdc.disconnect().await;
        }
        if self.load.is_connected() {
            self.load.disconnect().await;
        }
        info!("[DISCONNECT] all devices released");
    }

    async fn finish(
        &self,
        device: DeviceKind,
        transport: &TransportConfig,
        result: Result<String>,
    ) -> Result<String> {
        match result {
            Ok(version) => {
                info!("[CONNECT] {} ready on {} (version {})", device, transport, version);
                Ok(version)
            },
            Err(e) => {
                // a deadline can fire mid-handshake and leave the channel open
                match device {
                    DeviceKind::Load => self.load.disconnect().await,
                    DeviceKind::DetectionBoard => self.vdc.disconnect().await,
                }
                warn!("[CONNECT] {} on {} failed: {}", device, transport, e);
                Err(match e {
                    LinkError::Cancelled => LinkError::Cancelled,
                    other => LinkError::ConnectFailed {
                        device: device.to_string(),
                        reason: format!("{} ({})", other, transport),
                    },
                })
            },
        }
    }
}

async fn with_deadline<F>(deadline: Duration, connect: F) -> Result<String>
where
    F: Future<Output = Result<String>>,
{
    match tokio::time::timeout(deadline, connect).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::timeout(format!(
            "connect did not finish within {} ms",
            deadline.as_millis()
        ))),
    }
}
