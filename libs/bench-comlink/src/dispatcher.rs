//! Single-flight request dispatcher
//!
//! Owns a session's channel behind an async mutex so at most one exchange is
//! in flight per device. Requests complete in the order they obtain the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::hex::format_hex_pretty;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ResponseBoundary};
use crate::error::{LinkError, Result};

/// Who issued a request; decides whether its failure counts as a lost link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Post-connect probe; failures are reported by `connect`
    Handshake,
    /// Periodic poll; only a broken transport counts
    Poll,
    /// Explicit business call; any non-cancellation failure counts
    Command,
    /// Broadcast write that may legitimately go unanswered
    Broadcast,
}

impl RequestOrigin {
    pub fn signals_loss(self, err: &LinkError) -> bool {
        if err.is_cancelled() {
            return false;
        }
        match self {
            RequestOrigin::Command => true,
            RequestOrigin::Poll | RequestOrigin::Broadcast => err.is_link_down(),
            RequestOrigin::Handshake => false,
        }
    }
}

/// Called after the dispatcher has dropped a lost channel
pub type ConnectionLostCallback = Arc<dyn Fn(&LinkError) + Send + Sync>;

type ChannelSlot = Option<Box<dyn Channel>>;

pub struct Dispatcher {
    name: String,
    channel: Mutex<ChannelSlot>,
    connected: AtomicBool,
    on_connection_lost: ConnectionLostCallback,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, on_connection_lost: ConnectionLostCallback) -> Self {
        Self {
            name: name.into(),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            on_connection_lost,
        }
    }

    /// Lock-free connectivity flag
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ChannelSlot>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            guard = self.channel.lock() => Ok(guard),
        }
    }

    /// Replace any existing channel with `channel` and open it
    pub async fn open(&self, mut channel: Box<dyn Channel>, cancel: &CancellationToken) -> Result<()> {
        let mut slot = self.acquire(cancel).await?;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut old) = slot.take() {
            old.disconnect().await;
        }

        channel.connect(cancel).await?;
        info!(
            "[CONNECT] {}: {} {}",
            self.name,
            channel.channel_type(),
            channel.endpoint()
        );
        *slot = Some(channel);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the channel; waits for an in-flight exchange to finish
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut slot = self.channel.lock().await;
        if let Some(mut channel) = slot.take() {
            channel.disconnect().await;
            info!("[DISCONNECT] {}: {}", self.name, channel.endpoint());
        }
    }

    /// Run one request/response exchange under the single-flight lock
    pub async fn exchange(
        &self,
        request: &[u8],
        boundary: ResponseBoundary,
        origin: RequestOrigin,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let mut slot = self.acquire(cancel).await?;
        let channel = match slot.as_mut() {
            Some(channel) if self.is_connected() && channel.is_connected() => channel,
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(LinkError::NotConnected);
            },
        };

        debug!("{} TX: {}", self.name, format_hex_pretty(request));
        let result = channel.exchange(request, boundary, cancel).await;

        let teardown = match &result {
            Ok(response) => {
                if !response.is_empty() {
                    debug!("{} RX: {}", self.name, format_hex_pretty(response));
                }
                false
            },
            Err(e) => {
                debug!("{} exchange failed ({:?}): {}", self.name, origin, e);
                origin.signals_loss(e) || !channel.is_connected()
            },
        };

        if teardown {
            self.connected.store(false, Ordering::SeqCst);
            if let Some(mut channel) = slot.take() {
                channel.disconnect().await;
            }
        }
        drop(slot);

        // a failed handshake is reported by connect itself
        if teardown && origin != RequestOrigin::Handshake {
            if let Err(e) = &result {
                warn!("[STATUS] {}: connection lost: {}", self.name, e);
                (self.on_connection_lost)(e);
            }
        }
        result
    }
}
