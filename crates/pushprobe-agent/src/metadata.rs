use crate::error::{AgentError, Result};
use pushprobe_core::{Commander, MetadataConfig, METADATA_KEY};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Discovers this agent's identity and the controller endpoint.
///
/// The controller publishes a `MetadataConfig` under the `probeData` project
/// metadata item; agents locate it in the flattened key/value listing the
/// cloud CLI produces.
pub struct Discovery {
    commander: Arc<dyn Commander>,
}

impl Discovery {
    pub fn new(commander: Arc<dyn Commander>) -> Self {
        Self { commander }
    }

    /// This VM's hostname, which doubles as its zone name and RPC source.
    pub async fn hostname(&self) -> Result<String> {
        let out = self.commander.output("hostname", &[]).await?;
        Ok(out.trim().to_string())
    }

    /// Fetch and decode the published `MetadataConfig`.
    pub async fn fetch_metadata(&self) -> Result<MetadataConfig> {
        let listing = self
            .commander
            .output(
                "gcloud",
                &[
                    "compute",
                    "project-info",
                    "describe",
                    "--flatten",
                    "commonInstanceMetadata.items[]",
                ],
            )
            .await
            .map_err(|e| AgentError::metadata(e.to_string()))?;
        let config = parse_metadata_listing(&listing)?;
        info!("Discovered controller at {}:{}", config.host_ip, config.port);
        Ok(config)
    }

    /// Delete this agent's own instance; last resort when the controller is
    /// unreachable for the final stop ping.
    pub async fn self_delete(&self, hostname: &str) -> Result<()> {
        self.commander
            .run(
                "gcloud",
                &[
                    "compute",
                    "instances",
                    "delete",
                    hostname,
                    "--zone",
                    hostname,
                    "--quiet",
                ],
            )
            .await?;
        Ok(())
    }
}

/// Persist the certificate bundle so the TLS stack can read it from disk.
pub fn write_cert_bundle(config: &MetadataConfig, path: &Path) -> Result<()> {
    std::fs::write(path, &config.cert_bundle).map_err(|e| {
        AgentError::boot_failure(format!(
            "failed to write certificate bundle to {}: {e}",
            path.display()
        ))
    })
}

/// Locate the `probeData` item in a flattened metadata listing and decode
/// its value.
fn parse_metadata_listing(listing: &str) -> Result<MetadataConfig> {
    let mut lines = listing.lines();
    while let Some(line) = lines.next() {
        let Some((_, key)) = line.split_once("key:") else {
            continue;
        };
        if key.trim() != METADATA_KEY {
            continue;
        }

        let value_line = lines
            .next()
            .ok_or_else(|| AgentError::metadata("probeData item has no value"))?;
        let (_, value) = value_line
            .split_once("value:")
            .ok_or_else(|| AgentError::metadata("probeData item has no value"))?;

        let value = dequote(value.trim());
        return serde_json::from_str(value)
            .map_err(|e| AgentError::metadata(format!("invalid probeData payload: {e}")));
    }
    Err(AgentError::metadata(
        "probeData not found in project metadata",
    ))
}

/// Strip one layer of matching quotes the flattened listing may add.
fn dequote(s: &str) -> &str {
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushprobe_core::config::AccountInfo;
    use pushprobe_core::fake::FakeCommander;
    use tempfile::tempdir;

    fn sample_metadata() -> MetadataConfig {
        MetadataConfig {
            host_ip: "TEST_IP".to_string(),
            port: 50001,
            register_retries: 5,
            register_timeout_secs: 10,
            register_retry_interval_secs: 2,
            cert_bundle: "CERTS".to_string(),
            probe_log_destination: "probeLog".to_string(),
            error_log_destination: "errorLog".to_string(),
            account: AccountInfo {
                service_account: "probe@project.iam.gserviceaccount.com".to_string(),
            },
            token_retries: 12,
            startup_script_path: "assets/startup.sh".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_metadata_finds_probe_data_item() {
        let encoded = serde_json::to_string(&sample_metadata()).unwrap();
        let listing = format!(
            "testItem.key:   otherItem\ntestItem.value: ignored\n\
             testItem.key:   probeData\ntestItem.value: '{}'",
            encoded
        );
        let commander = Arc::new(FakeCommander::scripted(&[(&listing, false)], false));
        let discovery = Discovery::new(commander);

        let config = discovery.fetch_metadata().await.unwrap();

        assert_eq!(config.host_ip, "TEST_IP");
        assert_eq!(config, sample_metadata());
    }

    #[tokio::test]
    async fn test_fetch_metadata_missing_item() {
        let commander = Arc::new(FakeCommander::scripted(
            &[("testItem.key: other\ntestItem.value: x", false)],
            false,
        ));
        let discovery = Discovery::new(commander);

        let result = discovery.fetch_metadata().await;

        assert!(matches!(result.unwrap_err(), AgentError::Metadata { .. }));
    }

    #[tokio::test]
    async fn test_hostname_is_trimmed() {
        let commander = Arc::new(FakeCommander::scripted(&[("REGION-a\n", false)], false));
        let discovery = Discovery::new(commander);

        assert_eq!(discovery.hostname().await.unwrap(), "REGION-a");
    }

    #[tokio::test]
    async fn test_self_delete_targets_own_instance() {
        let commander = Arc::new(FakeCommander::scripted(&[("", false)], false));
        let discovery = Discovery::new(commander.clone());

        discovery.self_delete("REGION-a").await.unwrap();

        assert_eq!(
            commander.invocations()[0],
            "gcloud compute instances delete REGION-a --zone REGION-a --quiet"
        );
    }

    #[test]
    fn test_write_cert_bundle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.pem");

        write_cert_bundle(&sample_metadata(), &path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "CERTS");
    }

    #[test]
    fn test_dequote() {
        assert_eq!(dequote("'payload'"), "payload");
        assert_eq!(dequote("\"payload\""), "payload");
        assert_eq!(dequote("payload"), "payload");
    }
}
