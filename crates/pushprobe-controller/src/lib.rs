//! Pushprobe controller - fleet lifecycle and control plane
//!
//! This crate provides:
//! - Zone discovery and hardware filtering
//! - Regional VM records and their lifecycle state machine
//! - The orchestrator that provisions one agent per compatible region
//! - The mutually-authenticated control-plane server (Register + Ping)
//! - The liveness supervisor that restarts stalled agents
//! - TLS bootstrap and metadata publication for agent discovery

pub mod error;
pub mod logger;
pub mod metadata;
pub mod orchestrator;
pub mod server;
pub mod supervisor;
pub mod tls;
pub mod vm;
pub mod zones;

// Re-export commonly used types
pub use error::{ControllerError, Result};
pub use orchestrator::Controller;
pub use server::{ControlServer, ControlState};
pub use vm::{RegionalVM, VmState};
