//! Device data models
//!
//! Engineering-unit views of the raw register and info-block layouts.

pub mod load;
pub mod vdc;

pub use load::{
    ChannelLoadConfig, InverterStatus, LoadChannelStatus, LoadMode, LoadSnapshot, VoltageLevel,
};
pub use vdc::{DetectionChannel, DropStatus, IoCommand, IoStatus, VdcEnvironment, VdcSnapshot};
