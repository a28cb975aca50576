use crate::error::{ControllerError, Result};
use pushprobe_core::Commander;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Discovers cloud zones whose hardware satisfies the fleet requirements.
///
/// One zone per region by design: only `<region>-a` names are candidates.
pub struct ZoneFinder {
    commander: Arc<dyn Commander>,
}

impl ZoneFinder {
    pub fn new(commander: Arc<dyn Commander>) -> Self {
        Self { commander }
    }

    /// Return the zones whose descriptors contain every requirement string.
    ///
    /// An empty result is an error so the orchestrator never silently runs a
    /// zero-agent fleet.
    pub async fn compatible_zones(&self, requirements: &[String]) -> Result<Vec<String>> {
        let candidates = self.find_zones().await?;

        let mut compatible = Vec::new();
        for zone in candidates {
            let descriptor = self.zone_descriptor(&zone).await?;
            if meets_requirements(&descriptor, requirements) {
                compatible.push(zone);
            } else {
                debug!("Zone {} does not meet requirements", zone);
            }
        }

        if compatible.is_empty() {
            return Err(ControllerError::NoZonesAvailable);
        }
        Ok(compatible)
    }

    /// Enumerate candidate zones, keeping one per region.
    async fn find_zones(&self) -> Result<Vec<String>> {
        let listing = self
            .commander
            .output("gcloud", &["compute", "zones", "list"])
            .await
            .map_err(|e| ControllerError::enumeration_failed(e.to_string()))?;
        Ok(select_region_zones(&listing))
    }

    async fn zone_descriptor(&self, zone: &str) -> Result<String> {
        self.commander
            .output("gcloud", &["compute", "regions", "describe", zone])
            .await
            .map_err(|e| ControllerError::enumeration_failed(e.to_string()))
    }
}

/// Pick the `<prefix>-a` zone names out of a zone listing, in listing order.
fn select_region_zones(listing: &str) -> Vec<String> {
    let pattern = Regex::new(r"\b[A-Za-z][A-Za-z0-9-]*-a\b").expect("valid zone pattern");
    pattern
        .find_iter(listing)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn meets_requirements(descriptor: &str, requirements: &[String]) -> bool {
    requirements.iter().all(|req| descriptor.contains(req))
}
