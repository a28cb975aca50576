//! Pushprobe core - shared leaves of the probing fleet
//!
//! This crate provides:
//! - Configuration and wire-protocol types shared by controller and agent
//! - The command and clock ports that keep external effects testable
//! - Scripted fakes for both ports
//! - The time formats used for receipt file tags and log records

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod fake;
pub mod protocol;
pub mod timefmt;

// Re-export commonly used types
pub use clock::{Clock, SystemClock};
pub use command::{CommandOutput, Commander, HostCommander};
pub use config::{
    AccountInfo, ControllerConfig, MetadataConfig, PingConfig, ProbeConfig, ProbeType,
};
pub use error::{CoreError, Result};
pub use protocol::{Heartbeat, RegisterRequest, RegisterResponse, CONTROLLER_SOURCE, METADATA_KEY};
