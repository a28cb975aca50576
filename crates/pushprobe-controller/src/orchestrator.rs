use crate::error::Result;
use crate::logger::ControllerLogger;
use crate::metadata::MetadataPublisher;
use crate::server::{ControlServer, ControlState, VmMap};
use crate::supervisor::LivenessSupervisor;
use crate::tls::provision_tls;
use crate::vm::RegionalVM;
use crate::zones::ZoneFinder;
use pushprobe_core::{Clock, Commander, ControllerConfig, MetadataConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Assembles the fleet: discovers zones, provisions one VM per compatible
/// region, serves the control plane, and supervises liveness until every VM
/// has retired.
pub struct Controller {
    config: Arc<ControllerConfig>,
    vms: VmMap,
    stopped_count: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
    commander: Arc<dyn Commander>,
    clock: Arc<dyn Clock>,
    logger: ControllerLogger,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        commander: Arc<dyn Commander>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let logger = ControllerLogger::new(commander.clone(), &config.controller_log_destination);
        Self {
            config: Arc::new(config),
            vms: Arc::new(RwLock::new(HashMap::new())),
            stopped_count: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            commander,
            clock,
            logger,
        }
    }

    /// Signal fleet shutdown; agents observe it on their next ping.
    pub fn shutdown(&self) {
        info!("Controller entering shutdown");
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped_count.load(Ordering::SeqCst)
    }

    pub fn vms(&self) -> VmMap {
        self.vms.clone()
    }

    pub fn control_state(&self) -> ControlState {
        ControlState {
            vms: self.vms.clone(),
            config: self.config.clone(),
            shutting_down: self.shutting_down.clone(),
        }
    }

    /// Bootstrap the control plane: TLS material, metadata publication, and
    /// the RPC server ready to bind.
    pub async fn init_server(&self, data_dir: &Path) -> Result<ControlServer> {
        let tls = provision_tls(data_dir, &self.config.host_ip)?;

        let metadata = MetadataConfig {
            host_ip: self.config.host_ip.clone(),
            port: self.config.port,
            register_retries: self.config.ping.retries,
            register_timeout_secs: self.config.ping.timeout_secs,
            register_retry_interval_secs: self.config.ping.retry_interval_secs,
            cert_bundle: tls.agent_bundle(),
            probe_log_destination: self.config.probe_log_destination.clone(),
            error_log_destination: self.config.error_log_destination.clone(),
            account: self.config.account.clone(),
            token_retries: self.config.token_retries,
            startup_script_path: self.config.startup_script_path.clone(),
        };
        MetadataPublisher::new(self.commander.clone())
            .publish(&metadata)
            .await?;

        let addr: SocketAddr = format!("{}:{}", self.config.host_ip, self.config.port)
            .parse()
            .map_err(|e| {
                crate::error::ControllerError::boot_failure(format!("invalid bind address: {e}"))
            })?;

        Ok(ControlServer::new(addr, self.control_state(), tls))
    }

    /// Discover compatible zones, provision a VM per zone, assign probes,
    /// and start every VM that has work.
    pub async fn init_probes(&self) -> Result<()> {
        let finder = ZoneFinder::new(self.commander.clone());
        let requirements = vec![self.config.min_cpu_platform.clone()];
        let zones = finder.compatible_zones(&requirements).await?;

        {
            let mut vms = self.vms.write().await;
            for zone in zones {
                let vm = Arc::new(RegionalVM::new(
                    zone.clone(),
                    zone.clone(),
                    self.stopped_count.clone(),
                    self.shutting_down.clone(),
                    self.commander.clone(),
                    self.clock.clone(),
                ));
                vms.insert(zone, vm);
            }
        }

        for probe in &self.config.probes {
            let zone = format!("{}-a", probe.region);
            let vm = {
                let vms = self.vms.read().await;
                vms.get(&zone).cloned()
            };
            match vm {
                Some(vm) => vm.assign_probe(probe.clone()).await,
                None => {
                    warn!(
                        "Zone {} in region {} does not meet minimum requirements or does not exist",
                        zone, probe.region
                    );
                    self.logger
                        .log_error(&format!(
                            "zone {} in region {} does not meet minimum requirements or does not exist",
                            zone, probe.region
                        ))
                        .await;
                }
            }
        }

        // VMs with no probe assignment have nothing to do
        let mut idle_zones = Vec::new();
        let fleet: Vec<Arc<RegionalVM>> = {
            let vms = self.vms.read().await;
            vms.values().cloned().collect()
        };
        for vm in &fleet {
            if vm.probe_count().await == 0 {
                idle_zones.push(vm.zone().to_string());
            }
        }
        {
            let mut vms = self.vms.write().await;
            for zone in &idle_zones {
                vms.remove(zone);
            }
        }

        let fleet: Vec<Arc<RegionalVM>> = {
            let vms = self.vms.read().await;
            vms.values().cloned().collect()
        };
        for vm in fleet {
            if let Err(e) = vm.start(&self.config).await {
                warn!("Regional VM could not be started in zone {}: {}", vm.zone(), e);
                self.logger
                    .log_error(&format!(
                        "regional VM could not be started in zone {}: {}",
                        vm.zone(),
                        e
                    ))
                    .await;
            }
        }

        let count = self.vms.read().await.len();
        info!("Provisioned {} regional VMs", count);
        Ok(())
    }

    /// Run the liveness supervisor until the whole fleet has stopped.
    pub async fn monitor(&self) {
        let supervisor = LivenessSupervisor::new(
            self.vms.clone(),
            self.config.clone(),
            self.stopped_count.clone(),
            self.clock.clone(),
        );
        supervisor.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmState;
    use pushprobe_core::config::{AccountInfo, PingConfig, ProbeConfig};
    use pushprobe_core::fake::{FakeClock, FakeCommander};
    use pushprobe_core::ProbeType;

    fn probe_for(region: &str) -> ProbeConfig {
        ProbeConfig {
            region: region.to_string(),
            probe_type: ProbeType::Default,
            send_interval_secs: 10,
            receive_timeout_secs: 30,
        }
    }

    fn test_config(probes: Vec<ProbeConfig>) -> ControllerConfig {
        ControllerConfig {
            min_cpu_platform: "MIN_CPU".to_string(),
            disk_image: "probe-image".to_string(),
            account: AccountInfo {
                service_account: "probe@project.iam.gserviceaccount.com".to_string(),
            },
            host_ip: "127.0.0.1".to_string(),
            port: 50001,
            startup_script_path: "assets/startup.sh".to_string(),
            probe_log_destination: "probeLog".to_string(),
            error_log_destination: "errorLog".to_string(),
            controller_log_destination: "controllerLog".to_string(),
            ping: PingConfig {
                interval_secs: 1,
                timeout_secs: 0,
                retries: 3,
                retry_interval_secs: 1,
            },
            probes,
            token_retries: 12,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drives_fleet_to_stopped() {
        // Zone listing, three descriptors, two instance creates, two
        // instance stops issued by the restart path.
        let commander = Arc::new(FakeCommander::scripted(
            &[
                ("REGION-a\nREGION-b\nREGION2-a\nREGION2-b\nREGION3-a", false),
                ("INFORMATION\nMIN_CPU\nOTHER_INFORMATION", false),
                ("MIN_CPU", false),
                ("INFORMATION", false),
                ("", false),
                ("", false),
                ("", false),
                ("", false),
            ],
            false,
        ));
        let clock = Arc::new(FakeClock::at_secs(&[0, 0, 0, 0, 1], true));
        let controller = Controller::new(
            test_config(vec![probe_for("REGION"), probe_for("REGION2")]),
            commander.clone(),
            clock,
        );
        controller.shutdown();

        controller.init_probes().await.unwrap();
        controller.monitor().await;

        assert_eq!(controller.stopped_count(), 2);
        let vms = controller.vms();
        let vms = vms.read().await;
        assert_eq!(vms.len(), 2);
        assert_eq!(vms["REGION-a"].state().await, VmState::Stopped);
        assert_eq!(vms["REGION2-a"].state().await, VmState::Stopped);
        assert_eq!(commander.times_called(), 8);
    }

    #[tokio::test]
    async fn test_init_probes_skips_missing_zone_and_evicts_idle_vms() {
        // Listing yields two candidate zones but only REGION-a is
        // compatible; the REGION9 probe has no qualifying VM and the
        // controller logs it to its error channel.
        let commander = Arc::new(FakeCommander::scripted(
            &[
                ("REGION-a\nREGION2-a", false),
                ("MIN_CPU", false),
                ("INFORMATION", false),
                ("", false), // ZoneMissing error log write
                ("", false), // instance create for REGION-a
            ],
            false,
        ));
        let clock = Arc::new(FakeClock::at_secs(&[0], true));
        let controller = Controller::new(
            test_config(vec![probe_for("REGION"), probe_for("REGION9")]),
            commander.clone(),
            clock,
        );

        controller.init_probes().await.unwrap();

        let vms = controller.vms();
        let vms = vms.read().await;
        assert_eq!(vms.len(), 1);
        assert!(vms.contains_key("REGION-a"));
        assert_eq!(vms["REGION-a"].state().await, VmState::Starting);

        let invocations = commander.invocations();
        assert!(invocations
            .iter()
            .any(|cmd| cmd.starts_with("gcloud logging write controllerLog")));
    }

    #[tokio::test]
    async fn test_init_probes_propagates_no_zones() {
        let commander = Arc::new(FakeCommander::scripted(
            &[("REGION-a", false), ("INFORMATION", false)],
            false,
        ));
        let clock = Arc::new(FakeClock::at_secs(&[0], true));
        let controller = Controller::new(test_config(vec![probe_for("REGION")]), commander, clock);

        let result = controller.init_probes().await;

        assert!(matches!(
            result.unwrap_err(),
            crate::error::ControllerError::NoZonesAvailable
        ));
    }
}
