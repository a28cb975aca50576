use crate::auth::Auth;
use crate::error::Result;
use crate::resolver::{ResolverInput, SentProbe};
use async_trait::async_trait;
use pushprobe_core::timefmt::file_tag;
use pushprobe_core::{Clock, Commander, ProbeConfig, ProbeType};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Seam for submitting one probe message to the push service.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Submit a message tagged with the formatted send time.
    async fn send(&self, time_tag: &str) -> Result<()>;
}

/// Sender that drives the external `send` script with a fresh access token.
pub struct ScriptPushSender {
    commander: Arc<dyn Commander>,
    auth: Arc<Auth>,
    device_token: String,
}

impl ScriptPushSender {
    pub fn new(
        commander: Arc<dyn Commander>,
        auth: Arc<Auth>,
        device_token: impl Into<String>,
    ) -> Self {
        Self {
            commander,
            auth,
            device_token: device_token.into(),
        }
    }
}

#[async_trait]
impl PushSender for ScriptPushSender {
    async fn send(&self, time_tag: &str) -> Result<()> {
        let token = self.auth.token().await?;
        self.commander
            .run(
                "bash",
                &[
                    "send",
                    "-d",
                    &self.device_token,
                    "-a",
                    &token,
                    "-t",
                    time_tag,
                ],
            )
            .await?;
        Ok(())
    }
}

/// Emits one probe per cadence tick and hands successful sends to the
/// resolver.
///
/// Only `Default` probes dispatch; `Topic` is recognized but has no send
/// path yet. A failed submit is logged and skipped without enqueueing.
pub struct Dispatcher {
    config: Arc<ProbeConfig>,
    sender: Arc<dyn PushSender>,
    clock: Arc<dyn Clock>,
    resolver_tx: mpsc::Sender<ResolverInput>,
    probing: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ProbeConfig>,
        sender: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
        resolver_tx: mpsc::Sender<ResolverInput>,
        probing: CancellationToken,
    ) -> Self {
        Self {
            config,
            sender,
            clock,
            resolver_tx,
            probing,
        }
    }

    pub async fn run(&self) {
        if self.config.probe_type != ProbeType::Default {
            info!(
                "No dispatcher for {} probes in region {}",
                self.config.probe_type.as_str(),
                self.config.region
            );
            return;
        }

        while !self.probing.is_cancelled() {
            let send_time = self.clock.now();
            match self.sender.send(&file_tag(&send_time)).await {
                Ok(()) => {
                    let sp = SentProbe {
                        send_time,
                        config: self.config.clone(),
                    };
                    if self.resolver_tx.send(ResolverInput::Probe(sp)).await.is_err() {
                        // Resolver input closed; probing is over
                        return;
                    }
                }
                Err(e) => {
                    warn!("Unable to send probe message: {}", e);
                }
            }

            tokio::select! {
                _ = self.probing.cancelled() => return,
                _ = tokio::time::sleep(self.config.send_interval()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender {
        sent: AtomicUsize,
        fail_first: bool,
    }

    impl CountingSender {
        fn new(fail_first: bool) -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl PushSender for CountingSender {
        async fn send(&self, _time_tag: &str) -> Result<()> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(crate::error::AgentError::rpc("send failed"));
            }
            Ok(())
        }
    }

    struct TickingClock {
        tick: AtomicUsize,
    }

    impl Clock for TickingClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            let n = self.tick.fetch_add(1, Ordering::SeqCst) as i64;
            chrono::DateTime::from_timestamp(n, 0).unwrap()
        }
    }

    fn probe_config(probe_type: ProbeType) -> Arc<ProbeConfig> {
        Arc::new(ProbeConfig {
            region: "us-east1".to_string(),
            probe_type,
            send_interval_secs: 1,
            receive_timeout_secs: 30,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_enqueues_each_successful_send() {
        let sender = Arc::new(CountingSender::new(false));
        let clock = Arc::new(TickingClock {
            tick: AtomicUsize::new(0),
        });
        let (tx, mut rx) = crate::resolver::channel();
        let probing = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            probe_config(ProbeType::Default),
            sender.clone(),
            clock,
            tx,
            probing.clone(),
        );

        let handle = tokio::spawn(async move { dispatcher.run().await });

        // Collect a few probes, then stop the dispatcher
        let mut received = 0;
        while received < 3 {
            if let Some(ResolverInput::Probe(_)) = rx.recv().await {
                received += 1;
            }
        }
        probing.cancel();
        handle.await.unwrap();

        assert!(sender.sent.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_skips_enqueue_on_send_failure() {
        let sender = Arc::new(CountingSender::new(true));
        let clock = Arc::new(TickingClock {
            tick: AtomicUsize::new(0),
        });
        let (tx, mut rx) = crate::resolver::channel();
        let probing = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            probe_config(ProbeType::Default),
            sender.clone(),
            clock,
            tx,
            probing.clone(),
        );
        let handle = tokio::spawn(async move { dispatcher.run().await });

        // The first send fails; the first probe that arrives is the second
        // send, stamped one tick later.
        let first = rx.recv().await.unwrap();
        probing.cancel();
        handle.await.unwrap();

        match first {
            ResolverInput::Probe(sp) => assert_eq!(sp.send_time.timestamp(), 1),
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_ignores_topic_probes() {
        let sender = Arc::new(CountingSender::new(false));
        let clock = Arc::new(TickingClock {
            tick: AtomicUsize::new(0),
        });
        let (tx, _rx) = crate::resolver::channel();
        let probing = CancellationToken::new();

        let dispatcher = Dispatcher::new(
            probe_config(ProbeType::Topic),
            sender.clone(),
            clock,
            tx,
            probing,
        );

        // Returns immediately without sending anything
        dispatcher.run().await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_stops_once_cancelled() {
        let sender = Arc::new(CountingSender::new(false));
        let clock = Arc::new(TickingClock {
            tick: AtomicUsize::new(0),
        });
        let (tx, _rx) = crate::resolver::channel();
        let probing = CancellationToken::new();
        probing.cancel();

        let dispatcher = Dispatcher::new(
            probe_config(ProbeType::Default),
            sender.clone(),
            clock,
            tx,
            probing,
        );

        dispatcher.run().await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }
}
