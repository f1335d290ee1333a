//! Voltage-drop detection board session
//!
//! Holding-register access over CRC-16 framing. Responses carry no
//! delimiter, so every exchange waits for the transport to go idle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{SessionCore, SessionEvent, SnapshotReader};
use crate::channel::{create_channel, Channel, ResponseBoundary};
use crate::codec::vdc_frame::{self, BROADCAST_SLAVE};
use crate::config::{SessionConfig, TransportConfig};
use crate::dispatcher::RequestOrigin;
use crate::error::{LinkError, Result};
use crate::models::vdc::{
    build_channels, format_version, reg, serial_number_from_registers,
    serial_number_to_registers, thresholds_from_registers, thresholds_to_registers,
    CHANNEL_COUNT, DROP_FLAG_WORDS, SERIAL_NUMBER_WORDS,
};
use crate::models::{DetectionChannel, IoCommand, IoStatus, VdcEnvironment, VdcSnapshot};

pub const DEFAULT_SLAVE_ID: u8 = 0x01;
pub const MAX_SLAVE_ID: u8 = 247;

pub fn validate_slave_id(slave: u8) -> Result<()> {
    if !(1..=MAX_SLAVE_ID).contains(&slave) {
        return Err(LinkError::validation(format!(
            "slave address {} outside 1..={}",
            slave, MAX_SLAVE_ID
        )));
    }
    Ok(())
}

fn baud_register(baud: u32) -> Result<u16> {
    match u16::try_from(baud) {
        Ok(0) | Err(_) => Err(LinkError::validation(format!(
            "baud rate {} does not fit the 16-bit register",
            baud
        ))),
        Ok(value) => Ok(value),
    }
}

struct VdcInner {
    core: Arc<SessionCore<VdcSnapshot>>,
    slave_id: AtomicU8,
}

impl VdcInner {
    fn slave(&self) -> u8 {
        self.slave_id.load(Ordering::SeqCst)
    }

    async fn read(
        &self,
        slave: u8,
        start: u16,
        count: u8,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Vec<u16>> {
        let request = vdc_frame::encode_read_holding(slave, start, count)?;
        let raw = self
            .core
            .dispatcher()
            .exchange(&request, ResponseBoundary::IdleGap, origin, cancel)
            .await?;
        let payload = vdc_frame::decode(&raw)?;
        vdc_frame::parse_read_response(&payload, slave, usize::from(count))
    }

    async fn write(
        &self,
        slave: u8,
        start: u16,
        values: &[u16],
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.write_answered_by(slave, &[slave], start, values, origin, cancel)
            .await
    }

    /// Write where the reply may come from any id in `repliers`
    async fn write_answered_by(
        &self,
        slave: u8,
        repliers: &[u8],
        start: u16,
        values: &[u16],
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = vdc_frame::encode_write_multiple(slave, start, values)?;
        let raw = self
            .core
            .dispatcher()
            .exchange(&request, ResponseBoundary::IdleGap, origin, cancel)
            .await?;
        let payload = vdc_frame::decode(&raw)?;
        let replier = repliers
            .iter()
            .copied()
            .find(|id| payload.first() == Some(id))
            .unwrap_or(slave);
        vdc_frame::parse_write_response(&payload, replier)
    }

    async fn read_version(&self, origin: RequestOrigin, cancel: &CancellationToken) -> Result<String> {
        let registers = self.read(self.slave(), reg::VERSION, 1, origin, cancel).await?;
        Ok(format_version(registers[0]))
    }

    async fn read_channels(
        &self,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectionChannel>> {
        let slave = self.slave();
        let count = CHANNEL_COUNT as u8;
        let voltages = self.read(slave, reg::VOLTAGES, count, origin, cancel).await?;
        let recovery = self.read(slave, reg::RECOVERY_TIMES, count, origin, cancel).await?;
        let flags = self
            .read(slave, reg::DROP_FLAGS, DROP_FLAG_WORDS as u8, origin, cancel)
            .await?;
        build_channels(&voltages, &recovery, &flags)
    }

    async fn read_io_status(&self, origin: RequestOrigin, cancel: &CancellationToken) -> Result<IoStatus> {
        let registers = self.read(self.slave(), reg::IO_STATUS, 1, origin, cancel).await?;
        Ok(IoStatus::from(registers[0]))
    }
}

#[async_trait]
impl SnapshotReader for VdcInner {
    type Snapshot = VdcSnapshot;

    async fn read_snapshot(
        &self,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<VdcSnapshot> {
        let channels = self.read_channels(origin, cancel).await?;
        let io = self.read_io_status(origin, cancel).await?;
        Ok(VdcSnapshot {
            channels,
            io,
            captured_at: chrono::Utc::now(),
        })
    }
}

/// Session with one VDC-32 detection board
#[derive(Clone)]
pub struct VdcSession {
    inner: Arc<VdcInner>,
}

impl std::fmt::Debug for VdcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VdcSession")
            .field("core", &self.inner.core)
            .field("slave_id", &self.slave_id())
            .finish()
    }
}

impl VdcSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(VdcInner {
                core: SessionCore::new("vdc", config),
                slave_id: AtomicU8::new(DEFAULT_SLAVE_ID),
            }),
        }
    }

    /// Open the configured transport and read the firmware version of `slave`
    pub async fn connect(
        &self,
        transport: &TransportConfig,
        slave: u8,
        cancel: &CancellationToken,
    ) -> Result<String> {
        validate_slave_id(slave)?;
        let channel = create_channel(transport)?;
        self.connect_with(channel, slave, cancel).await
    }

    pub async fn connect_with(
        &self,
        channel: Box<dyn Channel>,
        slave: u8,
        cancel: &CancellationToken,
    ) -> Result<String> {
        validate_slave_id(slave)?;
        self.inner.slave_id.store(slave, Ordering::SeqCst);

        let inner = &self.inner;
        inner
            .core
            .establish(
                channel,
                Arc::downgrade(inner),
                || inner.read_version(RequestOrigin::Handshake, cancel),
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

    pub fn slave_id(&self) -> u8 {
        self.inner.slave()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent<VdcSnapshot>> {
        self.inner.core.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<VdcSnapshot>> {
        self.inner.core.latest()
    }

    pub fn watchdog_running(&self) -> bool {
        self.inner.core.watchdog().is_running()
    }

    pub async fn poll_now(&self, cancel: &CancellationToken) -> Result<Option<Arc<VdcSnapshot>>> {
        self.inner
            .core
            .poll_once(self.inner.as_ref(), RequestOrigin::Command, cancel)
            .await
    }

    // ------------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------------

    pub async fn read_holding_registers(
        &self,
        start: u16,
        count: u8,
        cancel: &CancellationToken,
    ) -> Result<Vec<u16>> {
        self.inner
            .read(self.inner.slave(), start, count, RequestOrigin::Command, cancel)
            .await
    }

    pub async fn write_registers(
        &self,
        start: u16,
        values: &[u16],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner
            .write(self.inner.slave(), start, values, RequestOrigin::Command, cancel)
            .await
    }

    // ------------------------------------------------------------------------
    // Device operations
    // ------------------------------------------------------------------------

    pub async fn read_version(&self, cancel: &CancellationToken) -> Result<String> {
        self.inner.read_version(RequestOrigin::Command, cancel).await
    }

    pub async fn read_channels(&self, cancel: &CancellationToken) -> Result<Vec<DetectionChannel>> {
        self.inner.read_channels(RequestOrigin::Command, cancel).await
    }

    pub async fn read_io_status(&self, cancel: &CancellationToken) -> Result<IoStatus> {
        self.inner.read_io_status(RequestOrigin::Command, cancel).await
    }

    pub async fn set_io_output(&self, command: IoCommand, cancel: &CancellationToken) -> Result<()> {
        self.write_registers(reg::IO_STATUS, &[command.code()], cancel)
            .await?;
        info!("vdc I/O command {:?} (0x{:04X})", command, command.code());
        Ok(())
    }

    pub async fn read_io_direction(&self, cancel: &CancellationToken) -> Result<u16> {
        let registers = self.read_holding_registers(reg::IO_DIRECTION, 1, cancel).await?;
        Ok(registers[0])
    }

    pub async fn set_io_direction(&self, direction: u16, cancel: &CancellationToken) -> Result<()> {
        self.write_registers(reg::IO_DIRECTION, &[direction], cancel).await
    }

    /// Drop thresholds of all channels, volts
    pub async fn read_thresholds(&self, cancel: &CancellationToken) -> Result<Vec<f64>> {
        let registers = self
            .read_holding_registers(reg::THRESHOLDS, CHANNEL_COUNT as u8, cancel)
            .await?;
        Ok(thresholds_from_registers(&registers))
    }

    /// Write thresholds starting at channel 1
    pub async fn set_thresholds(&self, thresholds: &[f64], cancel: &CancellationToken) -> Result<()> {
        let registers = thresholds_to_registers(thresholds)?;
        self.write_registers(reg::THRESHOLDS, &registers, cancel).await?;
        info!("vdc thresholds written for {} channels", registers.len());
        Ok(())
    }

    pub async fn clear_drop_flags(&self, cancel: &CancellationToken) -> Result<()> {
        self.write_registers(reg::DROP_FLAGS, &[0; DROP_FLAG_WORDS], cancel)
            .await?;
        info!("vdc drop flags cleared");
        Ok(())
    }

    pub async fn read_serial_number(&self, cancel: &CancellationToken) -> Result<String> {
        let registers = self
            .read_holding_registers(reg::SERIAL_NUMBER, SERIAL_NUMBER_WORDS as u8, cancel)
            .await?;
        Ok(serial_number_from_registers(&registers))
    }

    pub async fn set_serial_number(&self, serial: &str, cancel: &CancellationToken) -> Result<()> {
        let registers = serial_number_to_registers(serial)?;
        self.write_registers(reg::SERIAL_NUMBER, &registers, cancel).await?;
        info!("vdc serial number set: {}", serial);
        Ok(())
    }

    /// Change the board's address; later requests use the new one
    pub async fn set_slave_address(&self, slave: u8, cancel: &CancellationToken) -> Result<()> {
        validate_slave_id(slave)?;
        let current = self.inner.slave();
        // boards differ in whether they answer from the old or the new address
        self.inner
            .write_answered_by(
                current,
                &[current, slave],
                reg::SLAVE_ADDRESS,
                &[u16::from(slave)],
                RequestOrigin::Command,
                cancel,
            )
            .await?;
        let old = self.inner.slave_id.swap(slave, Ordering::SeqCst);
        info!("vdc slave address {} -> {}", old, slave);
        Ok(())
    }

    pub async fn read_baud_rate(&self, cancel: &CancellationToken) -> Result<u32> {
        let registers = self.read_holding_registers(reg::BAUD_RATE, 1, cancel).await?;
        Ok(u32::from(registers[0]))
    }

    pub async fn set_baud_rate(&self, baud: u32, cancel: &CancellationToken) -> Result<()> {
        let value = baud_register(baud)?;
        self.write_registers(reg::BAUD_RATE, &[value], cancel).await
    }

    /// Write the baud rate to every board on the bus
    ///
    /// Boards do not answer broadcasts, so a timeout counts as success.
    pub async fn broadcast_baud_rate(&self, baud: u32, cancel: &CancellationToken) -> Result<()> {
        let value = baud_register(baud)?;
        match self
            .inner
            .write(BROADCAST_SLAVE, reg::BAUD_RATE, &[value], RequestOrigin::Broadcast, cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_timeout() => {
                debug!("vdc broadcast baud {} sent, no reply", baud);
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    pub async fn read_temperature(&self, cancel: &CancellationToken) -> Result<f64> {
        let registers = self.read_holding_registers(reg::TEMPERATURE, 1, cancel).await?;
        Ok(f64::from(registers[0]))
    }

    pub async fn read_fan_current(&self, cancel: &CancellationToken) -> Result<u16> {
        let registers = self.read_holding_registers(reg::FAN_CURRENT, 1, cancel).await?;
        Ok(registers[0])
    }

    pub async fn read_ac_dependency(&self, cancel: &CancellationToken) -> Result<bool> {
        let registers = self.read_holding_registers(reg::AC_DEPENDENCY, 1, cancel).await?;
        Ok(registers[0] == 1)
    }

    pub async fn set_ac_dependency(&self, enabled: bool, cancel: &CancellationToken) -> Result<()> {
        self.write_registers(reg::AC_DEPENDENCY, &[u16::from(enabled)], cancel)
            .await
    }

    /// Temperature, fan current and AC dependency in one call
    pub async fn read_environment(&self, cancel: &CancellationToken) -> Result<VdcEnvironment> {
        let temperature = self.read_temperature(cancel).await?;
        let fan_current_ma = self.read_fan_current(cancel).await?;
        let ac_depends_on_jig = self.read_ac_dependency(cancel).await?;
        Ok(VdcEnvironment {
            temperature,
            fan_current_ma,
            ac_depends_on_jig,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::channel::mock::{MockChannel, MockHandle};
    use crate::models::DropStatus;
    use std::time::Duration;

    fn read_reply(slave: u8, registers: &[u16]) -> Vec<u8> {
        let mut frame = vec![slave, vdc_frame::FC_READ_HOLDING, (registers.len() * 2) as u8];
        for value in registers {
            frame.extend_from_slice(&value.to_be_bytes());
        }
        vdc_frame::append_crc(&mut frame);
        frame
    }

    fn write_reply(slave: u8, start: u16, count: u16) -> Vec<u8> {
        let mut frame = vec![slave, vdc_frame::FC_WRITE_MULTIPLE];
        frame.extend_from_slice(&start.to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());
        vdc_frame::append_crc(&mut frame);
        frame
    }

    async fn connected_session() -> (VdcSession, MockHandle) {
        let config = SessionConfig {
            poll_interval_ms: 60_000,
            ..SessionConfig::detection_board()
        };
        let session = VdcSession::new(config);
        let (channel, handle) = MockChannel::new();
        handle.push_reply(read_reply(1, &[12]));
        let version = session
            .connect_with(Box::new(channel), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(version, "1.2");
        (session, handle)
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_slave() {
        let session = VdcSession::new(SessionConfig::detection_board());
        for slave in [0, 248] {
            let (channel, handle) = MockChannel::new();
            let err = session
                .connect_with(Box::new(channel), slave, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, LinkError::Validation(_)));
            assert!(handle.requests().is_empty());
        }
    }

    #[tokio::test]
    async fn test_handshake_reads_version_register() {
        let (session, handle) = connected_session().await;
        assert!(session.is_polling());
        assert_eq!(
            handle.requests()[0],
            vdc_frame::encode_read_holding(1, reg::VERSION, 1).unwrap()
        );
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_garbage_handshake_leaves_session_down() {
        let session = VdcSession::new(SessionConfig::detection_board());
        let (channel, handle) = MockChannel::new();
        handle.push_reply(vec![0x01, 0x03, 0x02, 0x00, 0x0C, 0xFF, 0xFF]);
        let err = session
            .connect_with(Box::new(channel), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Handshake(_)));
        assert!(!session.is_connected());
        assert!(!session.is_polling());
    }

    #[tokio::test]
    async fn test_poll_combines_three_reads_and_io() {
        let (session, handle) = connected_session().await;
        let mut voltages = vec![0x03E8u16; 32];
        voltages[1] = 0x01F4;
        let mut recovery = vec![0u16; 32];
        recovery[2] = 15;
        handle.push_reply(read_reply(1, &voltages));
        handle.push_reply(read_reply(1, &recovery));
        // channels 2 and 3 flagged
        handle.push_reply(read_reply(1, &[0b0110, 0]));
        handle.push_reply(read_reply(1, &[0x2801]));

        let snapshot = session
            .poll_now(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.channels.len(), 32);
        assert_eq!(snapshot.channels[0].voltage, 1.0);
        assert_eq!(snapshot.channels[0].status, DropStatus::Ok);
        assert_eq!(snapshot.channels[1].voltage, 0.5);
        assert_eq!(snapshot.channels[1].status, DropStatus::Dropped);
        assert_eq!(snapshot.channels[2].status, DropStatus::Flagged);
        assert!(snapshot.io.outputs[0]);
        assert!(snapshot.io.jig_in_place);
        assert!(snapshot.io.fan_running);

        let requests = handle.requests();
        assert_eq!(requests[1], vdc_frame::encode_read_holding(1, reg::VOLTAGES, 32).unwrap());
        assert_eq!(requests[2], vdc_frame::encode_read_holding(1, reg::RECOVERY_TIMES, 32).unwrap());
        assert_eq!(requests[3], vdc_frame::encode_read_holding(1, reg::DROP_FLAGS, 2).unwrap());
        assert_eq!(requests[4], vdc_frame::encode_read_holding(1, reg::IO_STATUS, 1).unwrap());
    }

    #[tokio::test]
    async fn test_set_slave_address_updates_target() {
        let (session, handle) = connected_session().await;
        handle.push_reply(write_reply(1, reg::SLAVE_ADDRESS, 1));
        session
            .set_slave_address(7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.slave_id(), 7);

        handle.push_reply(read_reply(7, &[1]));
        assert!(session.read_ac_dependency(&CancellationToken::new()).await.unwrap());
        assert_eq!(handle.requests().last().unwrap()[0], 7);

        assert!(session
            .set_slave_address(0, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(session.slave_id(), 7);
    }

    #[tokio::test]
    async fn test_slave_address_reply_from_new_address() {
        let (session, handle) = connected_session().await;
        handle.push_reply(write_reply(9, reg::SLAVE_ADDRESS, 1));
        session
            .set_slave_address(9, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.slave_id(), 9);
    }

    #[tokio::test]
    async fn test_reply_from_other_board_rejected() {
        let (session, handle) = connected_session().await;
        handle.push_reply(read_reply(2, &[1]));
        let err = session
            .read_ac_dependency(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::UnexpectedResponse(_)), "got {err:?}");
        assert!(session.is_connected());

        handle.push_reply(write_reply(3, reg::SLAVE_ADDRESS, 1));
        assert!(session
            .set_slave_address(5, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(session.slave_id(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_baud_tolerates_timeout() {
        let config = SessionConfig {
            poll_interval_ms: 60_000,
            ..SessionConfig::detection_board()
        };
        let session = VdcSession::new(config);
        let (channel, handle) = MockChannel::new();
        let channel = channel.with_timeout(Duration::from_millis(30));
        handle.push_reply(read_reply(1, &[12]));
        session
            .connect_with(Box::new(channel), 1, &CancellationToken::new())
            .await
            .unwrap();

        session
            .broadcast_baud_rate(9600, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            handle.requests().last().unwrap(),
            &vdc_frame::encode_write_multiple(0, reg::BAUD_RATE, &[9600]).unwrap()
        );
        assert!(session.is_connected());

        assert!(matches!(
            session.set_baud_rate(115_200, &CancellationToken::new()).await,
            Err(LinkError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_exception_response_is_device_fault() {
        let (session, handle) = connected_session().await;
        let mut frame = vec![1, 0x83, 0x02];
        vdc_frame::append_crc(&mut frame);
        handle.push_reply(frame);
        let err = session
            .read_temperature(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::DeviceFault { code: 0x02 });
    }

    #[tokio::test]
    async fn test_serial_number_and_thresholds() {
        let (session, handle) = connected_session().await;

        let mut words = vec![0u16; 31];
        words[0] = u16::from_be_bytes(*b"VD");
        words[1] = u16::from_be_bytes(*b"C-");
        words[2] = u16::from_be_bytes([b'7', 0]);
        handle.push_reply(read_reply(1, &words));
        assert_eq!(
            session.read_serial_number(&CancellationToken::new()).await.unwrap(),
            "VDC-7"
        );

        handle.push_reply(write_reply(1, reg::THRESHOLDS, 2));
        session
            .set_thresholds(&[1.5, 2.25], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            handle.requests().last().unwrap(),
            &vdc_frame::encode_write_multiple(1, reg::THRESHOLDS, &[150, 225]).unwrap()
        );
    }
}
