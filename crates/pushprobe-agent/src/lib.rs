//! Pushprobe agent - per-region probe worker
//!
//! This crate provides:
//! - Discovery of the controller endpoint from project metadata
//! - The RPC client with bounded retries and the heartbeat loop
//! - Probe dispatchers that send one push message per cadence tick
//! - The resolver that correlates receipts with sends and classifies
//!   every probe exactly once
//! - Access-token caching and the emulator/device handler

pub mod auth;
pub mod control;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod logger;
pub mod metadata;
pub mod resolver;
pub mod rpc;

// Re-export commonly used types
pub use control::{Agent, AgentOptions};
pub use error::{AgentError, Result};
pub use resolver::{Resolver, ResolverInput, SentProbe};
pub use rpc::{ControlClient, HttpControlClient};
