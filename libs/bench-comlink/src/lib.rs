//! Bench Communication Link Library
//!
//! Device communication core for the bench test instruments: a 32-channel
//! voltage-drop detection board (VDC-32) and an 8-channel electronic load
//! (GJDD-750), reachable over a serial port or a TCP socket.
//!
//! # Architecture
//!
//! - **Channel**: one byte-stream transport, serial or TCP, with response
//!   boundary detection by terminator byte or idle gap
//! - **Codecs**: delimiter/checksum framing for the load, CRC-16 register
//!   framing for the detection board
//! - **Dispatcher**: single-flight request/response around the channel,
//!   reports link loss to its session
//! - **Watchdog**: liveness timer fed by successful polls
//! - **Sessions**: handshake, poll loop and business operations per device
//! - **Orchestrator**: keeps at most one device connected on the shared bus
//!
//! # Features
//!
//! - `test-utils` - exposes the scripted `MockChannel`

pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod watchdog;

pub use channel::{create_channel, Channel, ResponseBoundary};
pub use config::{LoadLimits, SerialConfig, SessionConfig, TcpConfig, TransportConfig};
pub use dispatcher::{Dispatcher, RequestOrigin};
pub use error::{LinkError, Result};
pub use orchestrator::{ConnectionManager, DeviceKind, DEFAULT_CONNECT_DEADLINE};
pub use session::{LoadSession, SessionEvent, VdcSession};
pub use watchdog::Watchdog;
