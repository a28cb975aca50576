use pushprobe_core::Commander;
use std::sync::Arc;
use tracing::warn;

/// Error channel of the controller in the cloud log sink.
///
/// Diagnostics still go through `tracing`; this sink is the durable record
/// operators watch.
pub struct ControllerLogger {
    commander: Arc<dyn Commander>,
    destination: String,
}

impl ControllerLogger {
    pub fn new(commander: Arc<dyn Commander>, destination: impl Into<String>) -> Self {
        Self {
            commander,
            destination: destination.into(),
        }
    }

    pub async fn log_error(&self, description: &str) {
        let result = self
            .commander
            .run(
                "gcloud",
                &["logging", "write", &self.destination, description],
            )
            .await;
        if let Err(e) = result {
            warn!("Unable to log error to {}: {}", self.destination, e);
        }
    }
}
