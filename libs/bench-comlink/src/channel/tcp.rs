//! TCP Channel Implementation
//!
//! Socket-backed channel with a bounded connect deadline. Bytes left over from
//! an earlier exchange or unsolicited device chatter are drained before each
//! request is written.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reader::{read_response, ReadTiming};
use super::traits::{Channel, ResponseBoundary};
use crate::config::TcpConfig;
use crate::error::{LinkError, Result};

/// TCP channel implementation
#[derive(Debug)]
pub struct TcpChannel {
    config: TcpConfig,
    stream: Option<TcpStream>,
}

impl TcpChannel {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn timing(&self) -> ReadTiming {
        ReadTiming {
            timeout: Duration::from_millis(self.config.receive_timeout_ms),
            settle: Duration::from_millis(self.config.settle_ms),
        }
    }

    /// Drop whatever is already sitting in the socket buffer
    fn discard_stale(stream: &TcpStream) -> Result<usize> {
        let mut buf = [0u8; 256];
        let mut discarded = 0;
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => return Err(LinkError::transport("connection closed by peer")),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(discarded),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn channel_type(&self) -> &'static str {
        "tcp"
    }

    fn endpoint(&self) -> String {
        self.address()
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.disconnect().await;

        let addr = self.address();
        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        debug!("Connecting to TCP endpoint: {}", addr);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            result = timeout(deadline, TcpStream::connect(&addr)) => result,
        };

        match connected {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                self.stream = Some(stream);
                Ok(())
            },
            Ok(Err(e)) => Err(LinkError::transport(format!("connect {}: {}", addr, e))),
            Err(_) => Err(LinkError::timeout(format!(
                "connect {} exceeded {} ms",
                addr, self.config.connect_timeout_ms
            ))),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {}", e);
            }
            info!("TCP disconnected: {}", self.address());
        }
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        boundary: ResponseBoundary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let timing = self.timing();
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;

        let result = async {
            let stale = Self::discard_stale(stream)?;
            if stale > 0 {
                debug!("TCP discarded {} stale bytes", stale);
            }
            stream.write_all(request).await?;
            read_response(stream, boundary, timing, cancel).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_link_down() {
                warn!("TCP link lost: {}", e);
                self.stream = None;
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
