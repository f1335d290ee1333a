//! Communication channels
//!
//! Serial and TCP implementations of [`Channel`] share one response reader so
//! both behave identically once the bytes are flowing.

mod reader;
pub mod serial;
pub mod tcp;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use serial::SerialChannel;
pub use tcp::TcpChannel;
pub use traits::{Channel, ResponseBoundary};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockChannel, MockHandle};

use crate::config::TransportConfig;
use crate::error::Result;

/// Largest response accepted before the exchange is failed
pub const MAX_RESPONSE_LEN: usize = 1024;

/// Build an unopened channel for the configured transport
pub fn create_channel(config: &TransportConfig) -> Result<Box<dyn Channel>> {
    config.validate()?;
    let channel: Box<dyn Channel> = match config {
        TransportConfig::Serial(cfg) => Box::new(SerialChannel::new(cfg.clone())),
        TransportConfig::Tcp(cfg) => Box::new(TcpChannel::new(cfg.clone())),
    };
    Ok(channel)
}
