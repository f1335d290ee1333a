//! Communication Link Error Types
//!
//! One variant per failure class a caller has to tell apart. Cancellation
//! and timeout stay distinct so the console can word them differently.

use thiserror::Error;

/// Result type for bench-comlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Communication link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinkError {
    /// Open, write or read failed at the channel level
    #[error("Transport error: {0}")]
    Transport(String),

    /// Channel is not open
    #[error("Not connected")]
    NotConnected,

    /// No response within the deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller-requested abort
    #[error("Operation cancelled")]
    Cancelled,

    /// Bad delimiter, under-length frame or inconsistent length field
    #[error("Frame error: {0}")]
    FrameIntegrity(String),

    /// Additive checksum of a load-device frame did not match
    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// CRC-16/Modbus of a detection-board frame did not match
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Device answered with a fault or exception code
    #[error("Device fault: code 0x{code:02X}")]
    DeviceFault { code: u8 },

    /// Well-formed frame with content that does not fit the request
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Input rejected before encoding
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport opened but the device did not answer the probe
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Invalid transport or session configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Orchestrator-level connect failure
    #[error("Failed to connect {device}: {reason}")]
    ConnectFailed { device: String, reason: String },
}

impl LinkError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a frame integrity error
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::FrameIntegrity(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unexpected response error
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The link itself is gone; further requests cannot succeed until reconnect
    pub fn is_link_down(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        LinkError::Transport(format!("serial: {}", err))
    }
}
