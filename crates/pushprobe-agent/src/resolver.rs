use crate::device::DeviceHandler;
use crate::logger::ProbeLogger;
use chrono::{DateTime, Utc};
use pushprobe_core::timefmt::file_tag;
use pushprobe_core::{Clock, ProbeConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the resolver input channel
pub const MAX_UNRESOLVED: usize = 2000;

/// How often still-unresolved probes are re-examined
const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receipt-sink body meaning "not found"
const NOT_FOUND: &str = "nf";

/// In-memory record of a dispatched probe awaiting correlation
#[derive(Debug, Clone)]
pub struct SentProbe {
    pub send_time: DateTime<Utc>,
    pub config: Arc<ProbeConfig>,
}

/// Input to the resolver: a probe to correlate, or the end-of-input
/// sentinel.
#[derive(Debug)]
pub enum ResolverInput {
    Probe(SentProbe),
    Close,
}

/// Create the bounded channel dispatchers feed the resolver through.
pub fn channel() -> (mpsc::Sender<ResolverInput>, mpsc::Receiver<ResolverInput>) {
    mpsc::channel(MAX_UNRESOLVED)
}

/// Signal end-of-input; every probe still in flight will be driven to a
/// terminal outcome before the resolver exits.
pub async fn close(tx: &mpsc::Sender<ResolverInput>) {
    let _ = tx.send(ResolverInput::Close).await;
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Resolved(i64),
    Timeout,
    Error,
    Unresolved,
}

/// Correlates receipts with sent probes and classifies every probe exactly
/// once as `resolved`, `timeout`, or `error`.
///
/// Probes whose receipt has not arrived yet sit in an internal pending queue
/// and are re-examined on a poll tick, so a concurrent close can never race
/// a re-enqueue. After the sentinel arrives the channel remainder is drained
/// and the pending queue is worked down to empty; outputs are ordered by
/// resolution time, not send time.
pub struct Resolver {
    rx: mpsc::Receiver<ResolverInput>,
    device: Arc<DeviceHandler>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn ProbeLogger>,
    device_token: String,
    latency_offset_ms: i64,
    pending: VecDeque<SentProbe>,
}

impl Resolver {
    /// Build the resolver, calibrating the clock offset between this host
    /// and the emulated device.
    pub async fn new(
        rx: mpsc::Receiver<ResolverInput>,
        device: Arc<DeviceHandler>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn ProbeLogger>,
        device_token: impl Into<String>,
    ) -> crate::error::Result<Self> {
        let latency_offset_ms = device.time_offset().await?;
        info!("Resolver calibrated with latency offset {}ms", latency_offset_ms);
        Ok(Self {
            rx,
            device,
            clock,
            logger,
            device_token: device_token.into(),
            latency_offset_ms,
            pending: VecDeque::new(),
        })
    }

    #[cfg(test)]
    fn with_offset(
        rx: mpsc::Receiver<ResolverInput>,
        device: Arc<DeviceHandler>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn ProbeLogger>,
        device_token: impl Into<String>,
        latency_offset_ms: i64,
    ) -> Self {
        Self {
            rx,
            device,
            clock,
            logger,
            device_token: device_token.into(),
            latency_offset_ms,
            pending: VecDeque::new(),
        }
    }

    /// Consume probes until the sentinel arrives and the worklist drains.
    pub async fn run(mut self) {
        let mut closed = false;
        loop {
            if !closed {
                tokio::select! {
                    item = self.rx.recv() => match item {
                        Some(ResolverInput::Probe(sp)) => self.handle(sp).await,
                        Some(ResolverInput::Close) | None => closed = true,
                    },
                    _ = tokio::time::sleep(PENDING_POLL_INTERVAL), if !self.pending.is_empty() => {
                        self.retry_pending().await;
                    }
                }
            } else {
                // Probes buffered behind the sentinel still get resolved
                while let Ok(item) = self.rx.try_recv() {
                    if let ResolverInput::Probe(sp) = item {
                        self.handle(sp).await;
                    }
                }
                if self.pending.is_empty() {
                    break;
                }
                self.retry_pending().await;
                if self.pending.is_empty() {
                    break;
                }
                tokio::time::sleep(PENDING_POLL_INTERVAL).await;
            }
        }
        info!("Resolver drained, exiting");
    }

    async fn handle(&mut self, sp: SentProbe) {
        match self.classify(&sp).await {
            Outcome::Unresolved => {
                debug!("Probe sent at {} still unresolved", sp.send_time);
                self.pending.push_back(sp);
            }
            outcome => self.log_outcome(&sp, outcome).await,
        }
    }

    async fn retry_pending(&mut self) {
        for _ in 0..self.pending.len() {
            let sp = match self.pending.pop_front() {
                Some(sp) => sp,
                None => break,
            };
            self.handle(sp).await;
        }
    }

    /// Decide the fate of one probe from the receipt sink.
    async fn classify(&self, sp: &SentProbe) -> Outcome {
        let file = format!(
            "{}{}",
            sp.config.probe_type.ordinal(),
            file_tag(&sp.send_time)
        );

        let body = match self.device.receipt(&file).await {
            Ok(body) => body,
            Err(_) => return Outcome::Error,
        };

        if body == NOT_FOUND {
            if self.clock.now() > sp.send_time + sp.config.receive_timeout() {
                return Outcome::Timeout;
            }
            return Outcome::Unresolved;
        }

        match body.trim().parse::<i64>() {
            Ok(receive_ms) => Outcome::Resolved(
                receive_ms - sp.send_time.timestamp_millis() + self.latency_offset_ms,
            ),
            Err(_) => Outcome::Error,
        }
    }

    async fn log_outcome(&self, sp: &SentProbe, outcome: Outcome) {
        let (state, latency) = match outcome {
            Outcome::Resolved(latency) => ("resolved", latency),
            Outcome::Timeout => ("timeout", -1),
            Outcome::Error => ("error", -1),
            Outcome::Unresolved => unreachable!("unresolved is not terminal"),
        };
        self.logger
            .log_probe(sp, state, latency, &self.device_token)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use pushprobe_core::config::ProbeType;
    use pushprobe_core::fake::{FakeClock, FakeCommander};
    use pushprobe_core::timefmt::log_stamp;

    fn probe_config(receive_timeout_secs: u64) -> Arc<ProbeConfig> {
        Arc::new(ProbeConfig {
            region: "us-east1".to_string(),
            probe_type: ProbeType::Default,
            send_interval_secs: 0,
            receive_timeout_secs,
        })
    }

    fn sent_probe(secs: i64, config: &Arc<ProbeConfig>) -> SentProbe {
        SentProbe {
            send_time: DateTime::from_timestamp(secs, 0).unwrap(),
            config: config.clone(),
        }
    }

    fn make_resolver(
        rx: mpsc::Receiver<ResolverInput>,
        commander: Arc<FakeCommander>,
        clock: Arc<FakeClock>,
        logger: Arc<MemoryLogger>,
    ) -> Resolver {
        let device = Arc::new(DeviceHandler::new(commander, clock.clone()));
        Resolver::with_offset(rx, device, clock, logger, "DEVICE_TOKEN", 0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_classifies_all_probes_exactly_once() {
        // Receipt sink answers "1000" for the first probe, then "nf" twice
        // for the second; the clock reads 3s on the first miss (inside the
        // window) and 100s on the retry (past it).
        let commander = Arc::new(FakeCommander::scripted(
            &[("1000", false), ("nf", false), ("nf", false)],
            false,
        ));
        let clock = Arc::new(FakeClock::at_secs(&[3, 100], false));
        let logger = Arc::new(MemoryLogger::new());

        let (tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger.clone());

        let config = probe_config(2);
        tx.send(ResolverInput::Probe(sent_probe(1, &config)))
            .await
            .unwrap();
        tx.send(ResolverInput::Probe(sent_probe(2, &config)))
            .await
            .unwrap();
        close(&tx).await;

        resolver.run().await;

        let records = logger.probe_records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            (
                log_stamp(&DateTime::from_timestamp(1, 0).unwrap()),
                "resolved".to_string(),
                0
            )
        );
        assert_eq!(
            records[1],
            (
                log_stamp(&DateTime::from_timestamp(2, 0).unwrap()),
                "timeout".to_string(),
                -1
            )
        );
    }

    #[tokio::test]
    async fn test_classify_resolved_latency() {
        let commander = Arc::new(FakeCommander::scripted(&[("1500", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[1], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        // Receipt at 1500ms against a send at 1000ms
        assert_eq!(outcome, Outcome::Resolved(500));
    }

    #[tokio::test]
    async fn test_classify_applies_latency_offset() {
        let commander = Arc::new(FakeCommander::scripted(&[("1500", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[1], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let device = Arc::new(DeviceHandler::new(commander, clock.clone()));
        let resolver =
            Resolver::with_offset(rx, device, clock, logger, "DEVICE_TOKEN", -200);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        assert_eq!(outcome, Outcome::Resolved(300));
    }

    #[tokio::test]
    async fn test_classify_sink_failure_is_error() {
        let commander = Arc::new(FakeCommander::scripted(&[("no sink", true)], false));
        let clock = Arc::new(FakeClock::at_secs(&[1], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        assert_eq!(outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn test_classify_timeout_past_window() {
        let commander = Arc::new(FakeCommander::scripted(&[("nf", false)], false));
        // Send at 1s, window 2s, clock reads 4s
        let clock = Arc::new(FakeClock::at_secs(&[4], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        assert_eq!(outcome, Outcome::Timeout);
    }

    #[tokio::test]
    async fn test_classify_unresolved_inside_window() {
        let commander = Arc::new(FakeCommander::scripted(&[("nf", false)], false));
        // Send at 1s, window 2s, clock reads exactly 3s: still inside
        let clock = Arc::new(FakeClock::at_secs(&[3], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        assert_eq!(outcome, Outcome::Unresolved);
    }

    #[tokio::test]
    async fn test_classify_unparsable_body_is_error() {
        let commander = Arc::new(FakeCommander::scripted(&[("INVALID_MESSAGE", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[1], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger);

        let outcome = resolver.classify(&sent_probe(1, &probe_config(2))).await;

        assert_eq!(outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn test_classify_queries_type_prefixed_receipt() {
        let commander = Arc::new(FakeCommander::scripted(&[("nf", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[1], true));
        let logger = Arc::new(MemoryLogger::new());
        let (_tx, rx) = channel();
        let resolver = make_resolver(rx, commander.clone(), clock, logger);

        let sp = sent_probe(1, &probe_config(2));
        resolver.classify(&sp).await;

        let expected = format!("bash receive 0{}.txt -p logs/", file_tag(&sp.send_time));
        assert_eq!(commander.invocations()[0], expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_sentinel_with_empty_worklist() {
        let commander = Arc::new(FakeCommander::scripted(&[("", false)], true));
        let clock = Arc::new(FakeClock::at_secs(&[0], true));
        let logger = Arc::new(MemoryLogger::new());
        let (tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger.clone());

        close(&tx).await;
        resolver.run().await;

        assert!(logger.probe_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resolves_probes_queued_before_close() {
        let commander = Arc::new(FakeCommander::scripted(&[("1000", false)], false));
        let clock = Arc::new(FakeClock::at_secs(&[0], true));
        let logger = Arc::new(MemoryLogger::new());
        let (tx, rx) = channel();
        let resolver = make_resolver(rx, commander, clock, logger.clone());

        // Both the probe and the sentinel are buffered before the resolver
        // starts consuming.
        tx.send(ResolverInput::Probe(sent_probe(1, &probe_config(2))))
            .await
            .unwrap();
        close(&tx).await;
        drop(tx);

        resolver.run().await;

        let records = logger.probe_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, "resolved");
    }
}
