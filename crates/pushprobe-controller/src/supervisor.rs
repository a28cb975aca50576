use crate::server::VmMap;
use crate::vm::{RegionalVM, VmState};
use chrono::{DateTime, Utc};
use pushprobe_core::{Clock, ControllerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches heartbeat freshness across the fleet and restarts stalled agents.
///
/// The sweep runs until every VM has retired; restarting rather than probing
/// deeper keeps the supervisor free of per-agent escalation state.
pub struct LivenessSupervisor {
    vms: VmMap,
    config: Arc<ControllerConfig>,
    stopped_count: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl LivenessSupervisor {
    pub fn new(
        vms: VmMap,
        config: Arc<ControllerConfig>,
        stopped_count: Arc<AtomicUsize>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vms,
            config,
            stopped_count,
            clock,
        }
    }

    /// Sweep the fleet until every VM is stopped.
    pub async fn run(&self) {
        info!(
            "Liveness supervisor running (timeout: {}s, sweep interval: {}s)",
            self.config.ping.timeout_secs, self.config.ping.interval_secs
        );

        loop {
            let fleet: Vec<Arc<RegionalVM>> = {
                let vms = self.vms.read().await;
                vms.values().cloned().collect()
            };

            if self.all_stopped(fleet.len()) {
                break;
            }

            for vm in &fleet {
                let state = vm.state().await;
                let last = vm.last_heartbeat().await;
                if is_timed_out(state, last, self.clock.now(), self.config.ping.timeout()) {
                    warn!(
                        "VM {} in zone {} missed its heartbeat window, restarting",
                        vm.name(),
                        vm.zone()
                    );
                    vm.restart(&self.config).await;
                } else {
                    debug!("VM {} heartbeat is fresh", vm.name());
                }
            }

            if self.all_stopped(fleet.len()) {
                break;
            }
            tokio::time::sleep(self.config.ping.interval()).await;
        }

        info!("All VMs stopped, liveness supervisor exiting");
    }

    fn all_stopped(&self, fleet_size: usize) -> bool {
        self.stopped_count.load(Ordering::SeqCst) >= fleet_size
    }
}

/// A VM is timed out when it should be heartbeating (`Starting`, `Idle`, or
/// `Probing`) and its last heartbeat is strictly older than the window.
pub fn is_timed_out(
    state: VmState,
    last_heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
    window: std::time::Duration,
) -> bool {
    let active = matches!(state, VmState::Starting | VmState::Idle | VmState::Probing);
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    active && now > last_heartbeat + window
}
