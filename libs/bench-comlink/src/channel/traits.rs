//! Channel trait
//!
//! A channel owns exactly one transport handle and moves request/response
//! byte sequences across it. Framing is the codec's business; the channel
//! only needs to know where a response ends.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// How the channel decides a response is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBoundary {
    /// Write only; the device never answers this request
    NoReply,
    /// Complete once the most recently received byte equals the terminator
    Terminator(u8),
    /// Like `Terminator`, but a terminator preceded by an odd run of
    /// `escape` bytes is payload and reading continues
    EscapedTerminator { end: u8, escape: u8 },
    /// Complete once the line stays quiet for the settle interval after the first byte
    IdleGap,
}

/// Uniform transport interface implemented by the serial and TCP channels
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Transport type identifier ("serial", "tcp", "mock")
    fn channel_type(&self) -> &'static str;

    /// Human-readable endpoint, e.g. "COM1@57600"
    fn endpoint(&self) -> String;

    /// Open the transport within its configured connect deadline
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Close the transport; idempotent and never fails
    async fn disconnect(&mut self);

    /// Discard stale input, write `request`, then read until `boundary`
    ///
    /// Fails with `Timeout` when the transport read deadline passes and with
    /// `Cancelled` when `cancel` fires first.
    async fn exchange(
        &mut self,
        request: &[u8],
        boundary: ResponseBoundary,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    fn is_connected(&self) -> bool;
}
