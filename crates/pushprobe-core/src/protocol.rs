//! Wire types of the control protocol between agents and the controller.

use crate::config::{AccountInfo, PingConfig, ProbeConfig};
use serde::{Deserialize, Serialize};

/// Source name the controller answers heartbeats with
pub const CONTROLLER_SOURCE: &str = "Controller";

/// Project-metadata key under which the controller publishes its
/// `MetadataConfig` for agents to discover
pub const METADATA_KEY: &str = "probeData";

/// First call an agent makes after boot, identifying itself by zone name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub source: String,
}

/// Everything an agent needs to start probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub probes: Vec<ProbeConfig>,
    pub account: AccountInfo,
    pub ping: PingConfig,
}

/// Bidirectional heartbeat; `stop` carries shutdown intent in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub source: String,
    pub stop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_round_trip() {
        let hb = Heartbeat {
            source: "us-east1-a".to_string(),
            stop: true,
        };
        let encoded = serde_json::to_string(&hb).unwrap();
        let decoded: Heartbeat = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, hb);
    }
}
