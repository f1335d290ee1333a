//! Electronic load session
//!
//! Speaks the delimiter/checksum framing of the GJDD-750. The handshake and
//! the poll loop both address the unit configured at connect time; business
//! calls take an explicit address so broadcast (0x00) writes stay possible.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionCore, SessionEvent, SnapshotReader};
use crate::channel::{create_channel, Channel, ResponseBoundary};
use crate::codec::load_frame::{self, cid, EOI, ROI};
use crate::config::{LoadLimits, SessionConfig, TransportConfig};
use crate::dispatcher::RequestOrigin;
use crate::error::{LinkError, Result};
use crate::models::load::{
    encode_all_configs, parse_channel_configs, parse_version, validate_channel_index,
    VOLTAGE_SCALE,
};
use crate::models::{ChannelLoadConfig, LoadSnapshot};

pub const DEFAULT_ADDRESS: u8 = 0x01;

struct LoadInner {
    core: Arc<SessionCore<LoadSnapshot>>,
    address: AtomicU8,
    limits: LoadLimits,
}

impl LoadInner {
    /// Encode, exchange and decode one command
    ///
    /// Broadcast commands in the no-reply set return an empty info block as
    /// soon as the request is written.
    async fn request(
        &self,
        addr: u8,
        command: u8,
        info: &[u8],
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let frame = load_frame::encode(addr, command, info)?;
        let expects_reply = load_frame::expects_reply(addr, command);
        let boundary = if expects_reply {
            ResponseBoundary::EscapedTerminator {
                end: EOI,
                escape: ROI,
            }
        } else {
            ResponseBoundary::NoReply
        };

        let raw = self
            .core
            .dispatcher()
            .exchange(&frame, boundary, origin, cancel)
            .await?;
        if !expects_reply {
            debug!("load broadcast 0x{:02X} sent, no reply expected", command);
            return Ok(Vec::new());
        }
        load_frame::decode(&raw)
    }

    async fn read_version(&self, addr: u8, origin: RequestOrigin, cancel: &CancellationToken) -> Result<String> {
        let info = self.request(addr, cid::READ_VERSION, &[], origin, cancel).await?;
        Ok(parse_version(&info))
    }

    async fn read_status(&self, addr: u8, origin: RequestOrigin, cancel: &CancellationToken) -> Result<LoadSnapshot> {
        let info = self.request(addr, cid::READ_STATUS, &[], origin, cancel).await?;
        LoadSnapshot::parse(&info)
    }
}

#[async_trait]
impl SnapshotReader for LoadInner {
    type Snapshot = LoadSnapshot;

    async fn read_snapshot(
        &self,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<LoadSnapshot> {
        let addr = self.address.load(Ordering::SeqCst);
        let snapshot = self.read_status(addr, origin, cancel).await?;

        // report inverter faults when they first appear or change
        let previous = self.core.latest().map(|s| s.inverter.raw);
        if snapshot.inverter.has_fault() && previous != Some(snapshot.inverter.raw) {
            let summary = snapshot.inverter.fault_summary();
            warn!("[STATUS] load inverter fault: {}", summary);
            self.core.emit(SessionEvent::Fault(summary));
        }
        Ok(snapshot)
    }
}

/// Session with one electronic load
#[derive(Clone)]
pub struct LoadSession {
    inner: Arc<LoadInner>,
}

impl std::fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSession")
            .field("core", &self.inner.core)
            .field("address", &self.address())
            .finish()
    }
}

impl LoadSession {
    pub fn new(config: SessionConfig, limits: LoadLimits) -> Self {
        Self {
            inner: Arc::new(LoadInner {
                core: SessionCore::new("load", config),
                address: AtomicU8::new(DEFAULT_ADDRESS),
                limits,
            }),
        }
    }

    /// Open the configured transport and verify the unit at `address` answers
    ///
    /// Returns the firmware version read during the handshake.
    pub async fn connect(
        &self,
        transport: &TransportConfig,
        address: u8,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let channel = create_channel(transport)?;
        self.connect_with(channel, address, cancel).await
    }

    /// Same as [`connect`](Self::connect) over an already-built channel
    pub async fn connect_with(
        &self,
        channel: Box<dyn Channel>,
        address: u8,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if address == load_frame::BROADCAST_ADDR {
            return Err(LinkError::validation(
                "the broadcast address cannot be used for a session",
            ));
        }
        self.inner.address.store(address, Ordering::SeqCst);

        let inner = &self.inner;
        inner
            .core
            .establish(
                channel,
                Arc::downgrade(inner),
                || inner.read_version(address, RequestOrigin::Handshake, cancel),
                cancel,
            )
            .await
    }

    pub async fn disconnect(&self) {
        self.inner.core.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.core.is_polling()
    }

    /// Unit address used by the handshake and the poll loop
    pub fn address(&self) -> u8 {
        self.inner.address.load(Ordering::SeqCst)
    }

    pub fn limits(&self) -> LoadLimits {
        self.inner.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent<LoadSnapshot>> {
        self.inner.core.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<LoadSnapshot>> {
        self.inner.core.latest()
    }

    pub fn watchdog_running(&self) -> bool {
        self.inner.core.watchdog().is_running()
    }

    /// Poll immediately, outside the periodic schedule
    pub async fn poll_now(&self, cancel: &CancellationToken) -> Result<Option<Arc<LoadSnapshot>>> {
        self.inner
            .core
            .poll_once(self.inner.as_ref(), RequestOrigin::Command, cancel)
            .await
    }

    pub async fn read_version(&self, addr: u8, cancel: &CancellationToken) -> Result<String> {
        self.inner
            .read_version(addr, RequestOrigin::Command, cancel)
            .await
    }

    /// Real-time voltage, current and status of all channels plus the inverter
    pub async fn read_status(&self, addr: u8, cancel: &CancellationToken) -> Result<LoadSnapshot> {
        self.inner.read_status(addr, RequestOrigin::Command, cancel).await
    }

    pub async fn read_channel_configs(
        &self,
        addr: u8,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelLoadConfig>> {
        let info = self
            .inner
            .request(addr, cid::READ_ALL_CONFIGS, &[], RequestOrigin::Command, cancel)
            .await?;
        parse_channel_configs(&info)
    }

    pub async fn read_channel_config(
        &self,
        addr: u8,
        index: u8,
        cancel: &CancellationToken,
    ) -> Result<ChannelLoadConfig> {
        validate_channel_index(index)?;
        self.read_channel_configs(addr, cancel)
            .await?
            .into_iter()
            .find(|cfg| cfg.index == index)
            .ok_or_else(|| LinkError::unexpected(format!("channel {} missing", index)))
    }

    /// Apply one channel's configuration; `persist` stores it in the device
    pub async fn set_channel_config(
        &self,
        addr: u8,
        config: &ChannelLoadConfig,
        persist: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = config.to_bytes()?;
        let mut info = Vec::with_capacity(record.len() + 1);
        info.push(config.index);
        info.extend_from_slice(&record);

        let command = if persist {
            cid::SET_CHANNEL_PERSIST
        } else {
            cid::SET_CHANNEL
        };
        self.inner
            .request(addr, command, &info, RequestOrigin::Command, cancel)
            .await?;
        info!(
            "load ch{} set: {} von={} V sp={} {}{}",
            config.index,
            config.mode,
            config.on_voltage,
            config.set_point,
            config.mode.unit(),
            if persist { " (saved)" } else { "" }
        );
        Ok(())
    }

    /// Apply all eight channels in one frame
    pub async fn set_all_channel_configs(
        &self,
        addr: u8,
        configs: &[ChannelLoadConfig],
        persist: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let info = encode_all_configs(configs)?;
        let command = if persist {
            cid::SET_ALL_CHANNELS_PERSIST
        } else {
            cid::SET_ALL_CHANNELS
        };
        self.inner
            .request(addr, command, &info, RequestOrigin::Command, cancel)
            .await?;
        info!("load all channels set{}", if persist { " (saved)" } else { "" });
        Ok(())
    }

    /// Set the overall output voltage, range-checked against the limits
    pub async fn set_output_voltage(
        &self,
        addr: u8,
        volts: f64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let limits = self.inner.limits;
        if !volts.is_finite()
            || volts < limits.min_output_voltage
            || volts > limits.max_output_voltage
        {
            return Err(LinkError::validation(format!(
                "output voltage {} V outside {}..={} V",
                volts, limits.min_output_voltage, limits.max_output_voltage
            )));
        }
        let raw = (volts * VOLTAGE_SCALE).round();
        if raw > f64::from(u16::MAX) {
            return Err(LinkError::validation(format!(
                "output voltage {} V not encodable",
                volts
            )));
        }
        let info = (raw as u16).to_be_bytes();
        self.inner
            .request(addr, cid::SET_OUTPUT_VOLTAGE, &info, RequestOrigin::Command, cancel)
            .await?;
        info!("load output voltage set: {} V", volts);
        Ok(())
    }
}
