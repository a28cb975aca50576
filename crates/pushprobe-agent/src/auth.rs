use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use pushprobe_core::Clock;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Metadata-server URL template for service-account tokens
const TOKEN_URL_BASE: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: String,
}

struct TokenState {
    token: String,
    expiry: DateTime<Utc>,
}

/// Access-token cache for the push-service sender.
///
/// A token is reused until `now >= expiry`; the first use past expiry
/// triggers a refresh against the platform metadata server.
pub struct Auth {
    http: reqwest::Client,
    token_url: String,
    clock: Arc<dyn Clock>,
    state: Mutex<TokenState>,
}

impl Auth {
    pub fn new(service_account: &str, clock: Arc<dyn Clock>) -> Self {
        Self::with_token_url(
            format!("{}/{}/token", TOKEN_URL_BASE, service_account),
            clock,
        )
    }

    pub fn with_token_url(token_url: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url,
            clock,
            state: Mutex::new(TokenState {
                token: String::new(),
                expiry: DateTime::UNIX_EPOCH,
            }),
        }
    }

    /// Return a valid access token, refreshing it if the cached one expired.
    pub async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if self.clock.now() >= state.expiry {
            self.refresh(&mut state).await?;
        }
        Ok(state.token.clone())
    }

    async fn refresh(&self, state: &mut TokenState) -> Result<()> {
        debug!("Refreshing access token");
        let resp = self
            .http
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AgentError::auth(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AgentError::auth(format!(
                "token request returned status {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::auth(format!("invalid token response: {e}")))?;

        state.token = body.access_token;
        state.expiry = self.clock.now() + chrono::Duration::seconds(body.expires_in);
        Ok(())
    }
}
