use crate::auth::Auth;
use crate::device::DeviceHandler;
use crate::dispatcher::{Dispatcher, ScriptPushSender};
use crate::error::{AgentError, Result};
use crate::heartbeat::HeartbeatLoop;
use crate::logger::{CloudLogger, ProbeLogger};
use crate::metadata::{write_cert_bundle, Discovery};
use crate::resolver::{self, Resolver};
use crate::rpc::{register_with_retries, ControlClient, HttpControlClient};
use pushprobe_core::{AccountInfo, Clock, Commander, MetadataConfig, PingConfig, ProbeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Launch options for one agent run.
#[derive(Debug, Default)]
pub struct AgentOptions {
    /// Where the certificate bundle from metadata is persisted
    pub cert_path: PathBuf,
    /// Skip project-metadata discovery and use this config instead
    pub metadata: Option<MetadataConfig>,
    /// Probe assignment for a direct launch without a controller
    pub probes: Option<Vec<ProbeConfig>>,
    /// Account for a direct launch without a controller
    pub account: Option<AccountInfo>,
}

/// The per-region probe worker.
///
/// Bootstraps the environment in a strict order, runs dispatchers, the
/// resolver, and the heartbeat loop, and tears everything down when the
/// controller signals stop. With an explicit probe assignment the agent runs
/// standalone and stops on cancellation instead of controller intent.
pub struct Agent {
    commander: Arc<dyn Commander>,
    clock: Arc<dyn Clock>,
}

impl Agent {
    pub fn new(commander: Arc<dyn Commander>, clock: Arc<dyn Clock>) -> Self {
        Self { commander, clock }
    }

    pub async fn run(&self, opts: AgentOptions, shutdown: CancellationToken) -> Result<()> {
        // Hostname first so every later failure is attributable to a region
        let discovery = Discovery::new(self.commander.clone());
        let hostname = discovery.hostname().await.map_err(|e| {
            error!("Unable to resolve hostname: {}", e);
            e
        })?;
        info!("Agent starting in {}", hostname);

        let meta = match opts.metadata {
            Some(meta) => meta,
            None => discovery.fetch_metadata().await.map_err(|e| {
                error!("Unable to acquire metadata: {}", e);
                e
            })?,
        };
        write_cert_bundle(&meta, &opts.cert_path)?;

        let logger: Arc<dyn ProbeLogger> = Arc::new(CloudLogger::new(
            self.commander.clone(),
            &hostname,
            &meta.probe_log_destination,
            &meta.error_log_destination,
        ));

        // Open the control channel and fetch the probe assignment, unless
        // this is a direct launch carrying its own assignment.
        let standalone = opts.probes.is_some() && opts.account.is_some();
        let mut client: Option<Arc<dyn ControlClient>> = None;
        let (probes, account, ping) = if standalone {
            let ping = PingConfig {
                interval_secs: 60,
                timeout_secs: meta.register_timeout_secs,
                retries: meta.register_retries,
                retry_interval_secs: meta.register_retry_interval_secs,
            };
            (opts.probes.unwrap(), opts.account.unwrap(), ping)
        } else {
            let http: Arc<dyn ControlClient> = Arc::new(HttpControlClient::new(&meta)?);
            let resp = match register_with_retries(http.as_ref(), &hostname, &meta).await {
                Ok(resp) => resp,
                Err(e) => {
                    logger
                        .log_error(&format!("unable to register with controller: {e}"))
                        .await;
                    return Err(e);
                }
            };
            client = Some(http);
            (resp.probes, resp.account, resp.ping)
        };

        // Device environment, strictly guarded
        let device = Arc::new(DeviceHandler::new(self.commander.clone(), self.clock.clone()));
        if let Err(e) = device.start_emulator().await {
            logger
                .log_error(&format!("could not start emulator: {e}"))
                .await;
            return Err(e);
        }
        if let Err(e) = device.start_app().await {
            logger.log_error(&format!("could not install app: {e}")).await;
            return Err(e);
        }
        let device_token = match device.device_token(meta.token_retries).await {
            Ok(token) => token,
            Err(e) => {
                logger
                    .log_error(&format!("could not acquire device token: {e}"))
                    .await;
                return Err(e);
            }
        };

        // Resolver calibrates the device clock offset before any probe flies
        let (resolver_tx, resolver_rx) = resolver::channel();
        let resolver = match Resolver::new(
            resolver_rx,
            device.clone(),
            self.clock.clone(),
            logger.clone(),
            &device_token,
        )
        .await
        {
            Ok(resolver) => resolver,
            Err(e) => {
                logger
                    .log_error(&format!("unable to start resolver: {e}"))
                    .await;
                return Err(e);
            }
        };
        let resolver_handle = tokio::spawn(resolver.run());

        // One dispatcher per assigned probe
        let auth = Arc::new(Auth::new(&account.service_account, self.clock.clone()));
        let sender = Arc::new(ScriptPushSender::new(
            self.commander.clone(),
            auth,
            &device_token,
        ));
        let probing = CancellationToken::new();
        let mut dispatcher_handles = Vec::new();
        for probe in probes {
            let dispatcher = Dispatcher::new(
                Arc::new(probe),
                sender.clone(),
                self.clock.clone(),
                resolver_tx.clone(),
                probing.clone(),
            );
            dispatcher_handles.push(tokio::spawn(async move { dispatcher.run().await }));
        }

        // Heartbeat until the controller (or a local cancellation) stops us
        let heartbeat = client
            .as_ref()
            .map(|c| HeartbeatLoop::new(c.clone(), &hostname, ping.clone()));
        let heartbeat_result = match &heartbeat {
            Some(hb) => tokio::select! {
                result = hb.run() => result,
                _ = shutdown.cancelled() => Ok(()),
            },
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        };
        if let Err(e) = &heartbeat_result {
            logger
                .log_error(&format!("communication with controller lost: {e}"))
                .await;
        }

        // Teardown: dispatchers first, then drain the resolver completely
        probing.cancel();
        for handle in dispatcher_handles {
            let _ = handle.await;
        }
        resolver::close(&resolver_tx).await;
        drop(resolver_tx);
        let _ = resolver_handle.await;

        // Confirm the stop; a dead control channel means the controller is
        // gone and this instance removes itself.
        let mut connection_lost = heartbeat_result.is_err();
        if let Some(hb) = &heartbeat {
            if let Err(e) = hb.confirm_stop().await {
                warn!("Failed to communicate stop to controller: {}", e);
                connection_lost = true;
            } else {
                connection_lost = false;
            }
        }

        if let Err(e) = device.uninstall_app().await {
            logger
                .log_error(&format!("unable to uninstall app: {e}"))
                .await;
        }
        if let Err(e) = device.kill_emulator().await {
            logger
                .log_error(&format!("could not kill emulator: {e}"))
                .await;
        }

        if connection_lost && !standalone {
            warn!("Controller unreachable, deleting own instance");
            discovery.self_delete(&hostname).await?;
            return Err(AgentError::boot_failure(
                "connection with controller lost, instance deleted",
            ));
        }

        info!("Agent {} stopped cleanly", hostname);
        Ok(())
    }
}
