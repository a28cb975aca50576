use crate::error::{AgentError, Result};
use async_trait::async_trait;
use pushprobe_core::{Heartbeat, MetadataConfig, PingConfig, RegisterRequest, RegisterResponse};
use std::time::Duration;
use tracing::{debug, warn};

/// Client seam for the control channel.
///
/// The production implementation speaks JSON over mutually-authenticated
/// HTTPS; tests substitute a scripted client.
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn register(
        &self,
        req: &RegisterRequest,
        timeout: Duration,
    ) -> Result<RegisterResponse>;

    async fn ping(&self, hb: &Heartbeat, timeout: Duration) -> Result<Heartbeat>;
}

/// HTTPS control-channel client presenting the agent identity from the
/// published certificate bundle.
pub struct HttpControlClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpControlClient {
    /// Build a client trusting the fleet CA and presenting the agent
    /// identity, both taken from the metadata certificate bundle. The CA is
    /// the first certificate in the bundle.
    pub fn new(meta: &MetadataConfig) -> Result<Self> {
        const CERT_END: &str = "-----END CERTIFICATE-----";
        let bundle = meta.cert_bundle.as_str();
        let ca_end = bundle
            .find(CERT_END)
            .map(|i| i + CERT_END.len())
            .ok_or_else(|| AgentError::boot_failure("no CA certificate in bundle"))?;

        let ca = reqwest::Certificate::from_pem(bundle[..ca_end].as_bytes())
            .map_err(|e| AgentError::boot_failure(format!("invalid CA certificate: {e}")))?;
        let identity = reqwest::Identity::from_pem(bundle.as_bytes())
            .map_err(|e| AgentError::boot_failure(format!("invalid agent identity: {e}")))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca)
            .identity(identity)
            .build()
            .map_err(|e| AgentError::boot_failure(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            base_url: format!("https://{}:{}", meta.host_ip, meta.port),
        })
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::deadline_exceeded(operation)
                } else {
                    AgentError::rpc(format!("{operation} request failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::rpc(format!(
                "{operation} returned status {status}: {body}"
            )));
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| AgentError::rpc(format!("invalid {operation} response: {e}")))
    }
}

#[async_trait]
impl ControlClient for HttpControlClient {
    async fn register(
        &self,
        req: &RegisterRequest,
        timeout: Duration,
    ) -> Result<RegisterResponse> {
        self.post("register", "/v1/register", req, timeout).await
    }

    async fn ping(&self, hb: &Heartbeat, timeout: Duration) -> Result<Heartbeat> {
        self.post("ping", "/v1/ping", hb, timeout).await
    }
}

/// Register with the controller under the bounded-retry policy.
///
/// A deadline miss is returned immediately; any other failure sleeps the
/// retry interval and tries again, up to the configured attempt budget.
pub async fn register_with_retries(
    client: &dyn ControlClient,
    source: &str,
    meta: &MetadataConfig,
) -> Result<RegisterResponse> {
    let req = RegisterRequest {
        source: source.to_string(),
    };
    let timeout = Duration::from_secs(meta.register_timeout_secs);

    for attempt in 0..meta.register_retries {
        match client.register(&req, timeout).await {
            Ok(resp) => return Ok(resp),
            Err(AgentError::DeadlineExceeded { operation }) => {
                return Err(AgentError::DeadlineExceeded { operation });
            }
            Err(e) => {
                warn!("Register attempt {} failed: {}", attempt + 1, e);
                tokio::time::sleep(Duration::from_secs(meta.register_retry_interval_secs)).await;
            }
        }
    }
    Err(AgentError::max_retries("register"))
}

/// Ping the controller under the same bounded-retry policy.
pub async fn ping_with_retries(
    client: &dyn ControlClient,
    source: &str,
    stop: bool,
    ping: &PingConfig,
) -> Result<Heartbeat> {
    let hb = Heartbeat {
        source: source.to_string(),
        stop,
    };

    for attempt in 0..ping.retries {
        match client.ping(&hb, ping.timeout()).await {
            Ok(resp) => return Ok(resp),
            Err(AgentError::DeadlineExceeded { operation }) => {
                return Err(AgentError::DeadlineExceeded { operation });
            }
            Err(e) => {
                warn!("Ping attempt {} failed: {}", attempt + 1, e);
                tokio::time::sleep(ping.retry_interval()).await;
            }
        }
    }
    Err(AgentError::max_retries("ping"))
}
