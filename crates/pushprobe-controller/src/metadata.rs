use crate::error::{ControllerError, Result};
use pushprobe_core::protocol::METADATA_KEY;
use pushprobe_core::{Commander, MetadataConfig};
use std::sync::Arc;
use tracing::info;

/// Publishes the fleet's `MetadataConfig` to cloud project metadata.
pub struct MetadataPublisher {
    commander: Arc<dyn Commander>,
}

impl MetadataPublisher {
    pub fn new(commander: Arc<dyn Commander>) -> Self {
        Self { commander }
    }

    pub async fn publish(&self, config: &MetadataConfig) -> Result<()> {
        let payload = serde_json::to_string(config)
            .map_err(|e| ControllerError::boot_failure(format!("failed to encode metadata: {e}")))?;
        let entry = format!("{}={}", METADATA_KEY, payload);

        self.commander
            .run(
                "gcloud",
                &["compute", "project-info", "add-metadata", "--metadata", &entry],
            )
            .await
            .map_err(|e| {
                ControllerError::boot_failure(format!("failed to publish metadata: {e}"))
            })?;

        info!("Published {} to project metadata", METADATA_KEY);
        Ok(())
    }
}
