use crate::error::{ControllerError, Result};
use chrono::{DateTime, Utc};
use pushprobe_core::{Clock, Commander, ControllerConfig, ProbeConfig};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle state of a regional VM.
///
/// `Stopped` is terminal: no transition escapes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Inactive,
    Starting,
    Idle,
    Probing,
    Stopped,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Inactive => "inactive",
            VmState::Starting => "starting",
            VmState::Idle => "idle",
            VmState::Probing => "probing",
            VmState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

struct VmInner {
    state: VmState,
    last_heartbeat: DateTime<Utc>,
    probes: Vec<ProbeConfig>,
}

/// Per-region agent VM record on the controller.
///
/// All mutable state sits behind one mutex; the fleet-wide stopped count and
/// the shutdown intent are shared atomics owned by the orchestrator. Cloud
/// commands are never issued while the mutex is held.
pub struct RegionalVM {
    zone: String,
    name: String,
    inner: Mutex<VmInner>,
    stopped_count: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    commander: Arc<dyn Commander>,
    clock: Arc<dyn Clock>,
}

impl RegionalVM {
    pub fn new(
        zone: impl Into<String>,
        name: impl Into<String>,
        stopped_count: Arc<AtomicUsize>,
        shutting_down: Arc<AtomicBool>,
        commander: Arc<dyn Commander>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            zone: zone.into(),
            name: name.into(),
            inner: Mutex::new(VmInner {
                state: VmState::Inactive,
                last_heartbeat: now,
                probes: Vec::new(),
            }),
            stopped_count,
            shutting_down,
            commander,
            clock,
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> VmState {
        self.inner.lock().await.state
    }

    pub async fn last_heartbeat(&self) -> DateTime<Utc> {
        self.inner.lock().await.last_heartbeat
    }

    pub async fn assign_probe(&self, probe: ProbeConfig) {
        self.inner.lock().await.probes.push(probe);
    }

    pub async fn probes(&self) -> Vec<ProbeConfig> {
        self.inner.lock().await.probes.clone()
    }

    pub async fn probe_count(&self) -> usize {
        self.inner.lock().await.probes.len()
    }

    /// Transition to `next`, rejecting any transition out of `Stopped`.
    ///
    /// The fleet-wide stopped count is incremented exactly once per VM, on
    /// the transition into `Stopped`.
    pub async fn set_state(&self, next: VmState) {
        let mut inner = self.inner.lock().await;
        if inner.state == VmState::Stopped {
            return;
        }
        if next == VmState::Stopped {
            self.stopped_count.fetch_add(1, Ordering::SeqCst);
            info!("VM {} in zone {} stopped", self.name, self.zone);
        }
        inner.state = next;
    }

    /// Refresh the heartbeat timestamp.
    pub async fn touch(&self) {
        let now = self.clock.now();
        self.inner.lock().await.last_heartbeat = now;
    }

    /// Create the cloud instance for this VM.
    ///
    /// On success the VM moves to `Starting` with a fresh heartbeat; on
    /// failure the state is left unchanged.
    pub async fn start(&self, config: &ControllerConfig) -> Result<()> {
        let startup = format!("startup-script={}", config.startup_script_path);
        let result = self
            .commander
            .run(
                "gcloud",
                &[
                    "compute",
                    "instances",
                    "create",
                    &self.name,
                    "--zone",
                    &self.zone,
                    "--min-cpu-platform",
                    &config.min_cpu_platform,
                    "--image",
                    &config.disk_image,
                    "--service-account",
                    &config.account.service_account,
                    "--metadata-from-file",
                    &startup,
                    "--machine-type",
                    "n1-standard-4",
                    "--scopes",
                    "cloud-platform",
                    "--quiet",
                ],
            )
            .await;

        if let Err(e) = result {
            return Err(ControllerError::start_failure(&self.zone, e.to_string()));
        }

        self.set_state(VmState::Starting).await;
        self.touch().await;
        Ok(())
    }

    /// Stop the cloud instance and either retire or relaunch the VM.
    ///
    /// When the controller is shutting down, or the VM is already retired,
    /// this lands in `Stopped`; otherwise the VM goes back through
    /// `Starting`, falling to `Stopped` if the relaunch fails.
    pub async fn restart(&self, config: &ControllerConfig) {
        if let Err(e) = self.stop_instance().await {
            warn!(
                "Failed to stop instance {} in zone {}: {}",
                self.name, self.zone, e
            );
        }

        let retired = self.state().await == VmState::Stopped;
        if self.shutting_down.load(Ordering::SeqCst) || retired {
            self.set_state(VmState::Stopped).await;
            return;
        }

        self.set_state(VmState::Starting).await;
        if let Err(e) = self.start(config).await {
            warn!(
                "Failed to relaunch VM {} in zone {}: {}",
                self.name, self.zone, e
            );
            self.set_state(VmState::Stopped).await;
        }
    }

    async fn stop_instance(&self) -> Result<()> {
        self.commander
            .run(
                "gcloud",
                &[
                    "compute",
                    "instances",
                    "stop",
                    &self.name,
                    "--zone",
                    &self.zone,
                    "--quiet",
                ],
            )
            .await?;
        Ok(())
    }
}
