use crate::resolver::SentProbe;
use async_trait::async_trait;
use pushprobe_core::timefmt::log_stamp;
use pushprobe_core::Commander;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// One probe outcome record in the probe log channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
    pub send_time: String,
    pub probe_type: String,
    pub latency: i64,
    pub state: String,
    pub region: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorRecord {
    description: String,
    region: String,
}

/// Sink for the agent's two cloud log channels.
#[async_trait]
pub trait ProbeLogger: Send + Sync {
    /// Emit the terminal record for a probe.
    async fn log_probe(&self, sp: &SentProbe, state: &str, latency: i64, token: &str);

    /// Emit an error record.
    async fn log_error(&self, description: &str);
}

/// Logger that writes JSON payloads to the cloud log channels.
pub struct CloudLogger {
    commander: Arc<dyn Commander>,
    region: String,
    probe_destination: String,
    error_destination: String,
}

impl CloudLogger {
    pub fn new(
        commander: Arc<dyn Commander>,
        region: impl Into<String>,
        probe_destination: impl Into<String>,
        error_destination: impl Into<String>,
    ) -> Self {
        Self {
            commander,
            region: region.into(),
            probe_destination: probe_destination.into(),
            error_destination: error_destination.into(),
        }
    }

    async fn write(&self, destination: &str, payload: &str) {
        let result = self
            .commander
            .run(
                "gcloud",
                &[
                    "logging",
                    "write",
                    "--payload-type=json",
                    destination,
                    payload,
                ],
            )
            .await;
        if let Err(e) = result {
            warn!("Unable to send log to {}: {}", destination, e);
        }
    }
}

#[async_trait]
impl ProbeLogger for CloudLogger {
    async fn log_probe(&self, sp: &SentProbe, state: &str, latency: i64, token: &str) {
        let record = ProbeRecord {
            send_time: log_stamp(&sp.send_time),
            probe_type: sp.config.probe_type.as_str().to_string(),
            latency,
            state: state.to_string(),
            region: self.region.clone(),
            token: token.to_string(),
        };
        match serde_json::to_string(&record) {
            Ok(payload) => self.write(&self.probe_destination, &payload).await,
            Err(e) => self.log_error(&format!("unable to encode probe record: {e}")).await,
        }
    }

    async fn log_error(&self, description: &str) {
        let record = ErrorRecord {
            description: description.to_string(),
            region: self.region.clone(),
        };
        match serde_json::to_string(&record) {
            Ok(payload) => self.write(&self.error_destination, &payload).await,
            Err(e) => warn!("Unable to encode error record: {}", e),
        }
    }
}

/// Logger that collects records in memory for assertions.
#[derive(Default)]
pub struct MemoryLogger {
    probes: std::sync::Mutex<Vec<(String, String, i64)>>,
    errors: std::sync::Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded probe outcomes as `(send_time, state, latency)`.
    pub fn probe_records(&self) -> Vec<(String, String, i64)> {
        self.probes.lock().unwrap().clone()
    }

    pub fn error_records(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProbeLogger for MemoryLogger {
    async fn log_probe(&self, sp: &SentProbe, state: &str, latency: i64, _token: &str) {
        self.probes.lock().unwrap().push((
            log_stamp(&sp.send_time),
            state.to_string(),
            latency,
        ));
    }

    async fn log_error(&self, description: &str) {
        self.errors.lock().unwrap().push(description.to_string());
    }
}
