//! Shared helpers for the bench instrument workspace
//!
//! Provides functions used by both the communication core and the console:
//! - logging initialisation
//! - hex formatting for frame traces
//! - layered configuration loading

pub mod config_loader;
pub mod error;
pub mod hex;
pub mod logging;

pub use error::{Error, Result};
