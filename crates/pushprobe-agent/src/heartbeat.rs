use crate::error::Result;
use crate::rpc::{ping_with_retries, ControlClient};
use pushprobe_core::PingConfig;
use std::sync::Arc;
use tracing::{debug, info};

/// Periodic heartbeat exchange with the controller.
///
/// The loop runs until the controller answers with `stop=true` or a ping
/// fails past its retry budget; in the failure case the caller tears the
/// agent down and, if the final stop ping also fails, deletes the instance.
pub struct HeartbeatLoop {
    client: Arc<dyn ControlClient>,
    source: String,
    ping: PingConfig,
}

impl HeartbeatLoop {
    pub fn new(client: Arc<dyn ControlClient>, source: impl Into<String>, ping: PingConfig) -> Self {
        Self {
            client,
            source: source.into(),
            ping,
        }
    }

    /// Ping until the controller signals shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Heartbeat loop running (interval: {}s)",
            self.ping.interval_secs
        );
        loop {
            let hb = ping_with_retries(self.client.as_ref(), &self.source, false, &self.ping).await?;
            if hb.stop {
                info!("Controller signalled stop");
                return Ok(());
            }
            debug!("Heartbeat acknowledged by {}", hb.source);
            tokio::time::sleep(self.ping.interval()).await;
        }
    }

    /// Tell the controller this agent is stopping.
    pub async fn confirm_stop(&self) -> Result<()> {
        ping_with_retries(self.client.as_ref(), &self.source, true, &self.ping).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::rpc::mock::MockControlClient;
    use std::sync::atomic::Ordering;

    fn test_ping_config() -> PingConfig {
        PingConfig {
            interval_secs: 0,
            timeout_secs: 1,
            retries: 1,
            retry_interval_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_loop_exits_on_controller_stop() {
        let client = Arc::new(MockControlClient::new());
        let hb = HeartbeatLoop::new(client.clone(), "Stop", test_ping_config());

        hb.run().await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_returns_error_when_retries_exhausted() {
        let client = Arc::new(MockControlClient::new());
        let hb = HeartbeatLoop::new(client, "Unavailable", test_ping_config());

        let result = hb.run().await;

        assert!(matches!(result.unwrap_err(), AgentError::MaxRetries { .. }));
    }

    #[tokio::test]
    async fn test_confirm_stop_pings_with_stop_flag() {
        let client = Arc::new(MockControlClient::new());
        let hb = HeartbeatLoop::new(client.clone(), "testHost", test_ping_config());

        hb.confirm_stop().await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confirm_stop_propagates_failure() {
        let client = Arc::new(MockControlClient::new());
        let hb = HeartbeatLoop::new(client, "Unavailable", test_ping_config());

        assert!(hb.confirm_stop().await.is_err());
    }
}
