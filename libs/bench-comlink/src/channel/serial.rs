//! Serial Channel Implementation
//!
//! Opens the named port at 8 data bits, no parity, 1 stop bit. Each exchange
//! clears the driver's input buffer before the request goes out.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reader::{read_response, ReadTiming};
use super::traits::{Channel, ResponseBoundary};
use crate::config::SerialConfig;
use crate::error::{LinkError, Result};

/// Serial channel implementation
#[derive(Debug)]
pub struct SerialChannel {
    config: SerialConfig,
    port: Option<SerialStream>,
}

impl SerialChannel {
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    fn timing(&self) -> ReadTiming {
        ReadTiming {
            timeout: Duration::from_millis(self.config.read_timeout_ms),
            settle: Duration::from_millis(self.config.settle_ms),
        }
    }

    fn open(&self) -> Result<SerialStream> {
        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open_native_async()?;
        Ok(port)
    }
}

#[async_trait]
impl Channel for SerialChannel {
    fn channel_type(&self) -> &'static str {
        "serial"
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.config.port, self.config.baud_rate)
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.disconnect().await;
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        debug!("Opening serial port: {}", self.endpoint());
        let port = self.open().map_err(|e| {
            LinkError::transport(format!("open {}: {}", self.config.port, e))
        })?;
        info!("Serial opened: {} (8N1)", self.endpoint());
        self.port = Some(port);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.port.take().is_some() {
            info!("Serial closed: {}", self.config.port);
        }
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        boundary: ResponseBoundary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let timing = self.timing();
        let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;

        let result = async {
            port.clear(ClearBuffer::Input)?;

            let write = async {
                port.write_all(request).await?;
                port.flush().await
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                written = timeout(write_timeout, write) => match written {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        return Err(LinkError::timeout(format!(
                            "write exceeded {} ms",
                            write_timeout.as_millis()
                        )))
                    },
                },
            }

            read_response(port, boundary, timing, cancel).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_link_down() {
                warn!("Serial link lost: {}", e);
                self.port = None;
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
