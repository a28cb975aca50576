use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of probe message sent through the push service.
///
/// `Topic` is recognized on the wire and in receipt file names but has no
/// dispatcher yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeType {
    #[default]
    Default,
    Topic,
}

impl ProbeType {
    /// Ordinal used as the prefix of receipt file names.
    pub fn ordinal(&self) -> u8 {
        match self {
            ProbeType::Default => 0,
            ProbeType::Topic => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Default => "default",
            ProbeType::Topic => "topic",
        }
    }
}

/// Behavior of one probe stream, assigned to the agent in its region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Region whose agent runs this probe (zone is `<region>-a`)
    pub region: String,
    #[serde(rename = "type", default)]
    pub probe_type: ProbeType,
    /// Seconds between probe sends
    pub send_interval_secs: u64,
    /// Seconds after which an undelivered probe is classified as a timeout
    pub receive_timeout_secs: u64,
}

impl ProbeConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn receive_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.receive_timeout_secs as i64)
    }
}

/// Heartbeat cadence and retry budget shared by controller and agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingConfig {
    /// Seconds between heartbeats; also the supervisor sweep interval
    pub interval_secs: u64,
    /// Per-call deadline in seconds; also the heartbeat-staleness window
    pub timeout_secs: u64,
    /// Maximum attempts before a call gives up
    pub retries: u32,
    /// Seconds between retry attempts
    pub retry_interval_secs: u64,
}

impl PingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Cloud account identity the agents send probes as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub service_account: String,
}

/// Controller configuration, read from the `--config` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Minimum CPU platform required of agent VMs
    pub min_cpu_platform: String,
    /// Disk image agent VMs boot from
    pub disk_image: String,
    pub account: AccountInfo,
    /// IP the control-plane server binds and certifies
    pub host_ip: String,
    pub port: u16,
    /// Startup script handed to created instances
    pub startup_script_path: String,
    pub probe_log_destination: String,
    pub error_log_destination: String,
    pub controller_log_destination: String,
    pub ping: PingConfig,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
    /// Attempts agents make when polling for the device token
    #[serde(default = "default_token_retries")]
    pub token_retries: u32,
}

fn default_token_retries() -> u32 {
    12
}

/// Configuration published to project metadata for agents to discover.
///
/// Carries everything an agent needs before it can open the control channel:
/// where the controller lives, how patiently to register, the TLS material,
/// and where its logs go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub host_ip: String,
    pub port: u16,
    pub register_retries: u32,
    pub register_timeout_secs: u64,
    pub register_retry_interval_secs: u64,
    /// PEM bundle: CA certificate plus the agent identity
    pub cert_bundle: String,
    pub probe_log_destination: String,
    pub error_log_destination: String,
    pub account: AccountInfo,
    /// Attempts when polling for the device token
    pub token_retries: u32,
    pub startup_script_path: String,
}
