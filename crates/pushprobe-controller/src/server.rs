use crate::error::{ControllerError, Result};
use crate::tls::TlsMaterial;
use crate::vm::{RegionalVM, VmState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pushprobe_core::{
    ControllerConfig, Heartbeat, RegisterRequest, RegisterResponse, CONTROLLER_SOURCE,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared map of provisioned VMs, keyed by zone name
pub type VmMap = Arc<RwLock<HashMap<String, Arc<RegionalVM>>>>;

/// State shared by the control-plane RPC handlers
#[derive(Clone)]
pub struct ControlState {
    pub vms: VmMap,
    pub config: Arc<ControllerConfig>,
    pub shutting_down: Arc<AtomicBool>,
}

/// Controller error carried across the RPC boundary, mapped onto an HTTP
/// status
#[derive(Debug)]
pub struct RpcError(ControllerError);

impl From<ControllerError> for RpcError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControllerError::UnknownAgent { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "status": "Failure",
            "message": self.0.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Register RPC.
///
/// Moves the VM to `Idle` and refreshes its heartbeat, except when it is
/// already retired: a stopped VM keeps its state but still receives its
/// probe assignment, and the agent observes the shutdown on its first ping.
pub async fn handle_register(
    state: &ControlState,
    req: &RegisterRequest,
) -> std::result::Result<RegisterResponse, RpcError> {
    let vm = {
        let vms = state.vms.read().await;
        vms.get(&req.source).cloned()
    };
    let vm = match vm {
        Some(vm) => vm,
        None => {
            warn!("Register from unknown source {}", req.source);
            return Err(ControllerError::unknown_agent(&req.source).into());
        }
    };

    if vm.state().await != VmState::Stopped {
        vm.set_state(VmState::Idle).await;
        vm.touch().await;
    }

    info!("Agent {} registered", req.source);
    Ok(RegisterResponse {
        probes: vm.probes().await,
        account: state.config.account.clone(),
        ping: state.config.ping.clone(),
    })
}

/// Ping RPC.
///
/// A `stop=true` heartbeat from the agent restarts its VM; otherwise the VM
/// is marked `Probing`. The heartbeat timestamp is always refreshed, and the
/// response carries the controller's current shutdown intent.
pub async fn handle_ping(
    state: &ControlState,
    hb: &Heartbeat,
) -> std::result::Result<Heartbeat, RpcError> {
    let vm = {
        let vms = state.vms.read().await;
        vms.get(&hb.source).cloned()
    };
    let vm = match vm {
        Some(vm) => vm,
        None => {
            warn!("Ping from unknown source {}", hb.source);
            return Err(ControllerError::unknown_agent(&hb.source).into());
        }
    };

    if hb.stop {
        vm.restart(&state.config).await;
    } else {
        vm.set_state(VmState::Probing).await;
    }
    vm.touch().await;

    Ok(Heartbeat {
        source: CONTROLLER_SOURCE.to_string(),
        stop: state.shutting_down.load(Ordering::SeqCst),
    })
}

async fn register(
    State(state): State<ControlState>,
    Json(req): Json<RegisterRequest>,
) -> std::result::Result<Json<RegisterResponse>, RpcError> {
    handle_register(&state, &req).await.map(Json)
}

async fn ping(
    State(state): State<ControlState>,
    Json(hb): Json<Heartbeat>,
) -> std::result::Result<Json<Heartbeat>, RpcError> {
    handle_ping(&state, &hb).await.map(Json)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the control-plane router.
pub fn build_router(state: ControlState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/register", post(register))
        .route("/v1/ping", post(ping))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Control-plane server bound over mutually-authenticated TLS.
pub struct ControlServer {
    addr: SocketAddr,
    state: ControlState,
    tls: TlsMaterial,
}

impl ControlServer {
    pub fn new(addr: SocketAddr, state: ControlState, tls: TlsMaterial) -> Self {
        Self { addr, state, tls }
    }

    /// Serve until the token is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let app = build_router(self.state);
        let rustls_config =
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(self.tls.server_config()?));

        info!("Control-plane server listening on {}", self.addr);

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            info!("Control-plane server shutting down");
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        axum_server::bind_rustls(self.addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| crate::error::ControllerError::boot_failure(format!("serve failed: {e}")))
    }
}
