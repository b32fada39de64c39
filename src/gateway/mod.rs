//! Transport Gateway: WebSocket endpoint bridging browser terminals to shells.
//!
//! Routes:
//! - `GET /terminal?serverId=..&userId=..` — WebSocket upgrade, one relay per socket
//! - `GET /health`
//! - `GET /sessions` — live and in-flight shell sessions

mod connection;

use crate::config::GatewayConfig;
use crate::error::ConnectError;
use crate::inventory::{CredentialStore, ServerInventory};
use crate::protocol::{ConnectParams, TermSize};
use crate::registry::{SessionRegistry, SessionSummary};
use crate::ssh::{SshAuth, SshConfig};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// How the gateway logs into servers.
#[derive(Debug, Clone)]
pub struct LoginDefaults {
    pub ssh_user: String,
    pub ssh_port: u16,
    pub fallback_key_path: Option<PathBuf>,
}

impl LoginDefaults {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            ssh_user: config.ssh_user.clone(),
            ssh_port: config.ssh_port,
            fallback_key_path: config.fallback_key_path.clone(),
        }
    }
}

impl Default for LoginDefaults {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

struct Shared {
    registry: SessionRegistry,
    inventory: Arc<dyn ServerInventory>,
    credentials: Arc<dyn CredentialStore>,
    login: LoginDefaults,
    active: AtomicUsize,
    next_connection_id: AtomicU64,
}

/// Shared gateway state handed to every request.
#[derive(Clone)]
pub struct GatewayState {
    shared: Arc<Shared>,
}

impl GatewayState {
    pub fn new(
        registry: SessionRegistry,
        inventory: Arc<dyn ServerInventory>,
        credentials: Arc<dyn CredentialStore>,
        login: LoginDefaults,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                inventory,
                credentials,
                login,
                active: AtomicUsize::new(0),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// Gateway connections currently open.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Work out host and credentials for `server_id`. A server without an
    /// address fails here, before any connection is attempted.
    pub async fn resolve_target(
        &self,
        server_id: u64,
        size: TermSize,
    ) -> Result<SshConfig, ConnectError> {
        let record = self
            .shared
            .inventory
            .lookup(server_id)
            .await
            .ok_or_else(|| {
                ConnectError::ServerNotReady(format!("server {} is not provisioned", server_id))
            })?;
        let host = record
            .reachable_address()
            .ok_or_else(|| {
                ConnectError::ServerNotReady(format!(
                    "server {} has no IP address yet",
                    server_id
                ))
            })?
            .to_string();

        let login = &self.shared.login;
        let mut auth = Vec::new();
        match self.shared.credentials.root_password(server_id).await {
            Ok(Some(password)) => auth.push(SshAuth::Password(password)),
            Ok(None) => log::debug!("No stored root password for server {}", server_id),
            Err(e) => log::warn!(
                "Stored credential for server {} is unusable: {:#}",
                server_id,
                e
            ),
        }
        if let Some(path) = &login.fallback_key_path {
            auth.push(SshAuth::KeyFile {
                path: path.display().to_string(),
                passphrase: None,
            });
        }
        if auth.is_empty() {
            return Err(ConnectError::AuthFailure(
                "no credential available for this server".to_string(),
            ));
        }

        Ok(SshConfig {
            host,
            port: login.ssh_port,
            username: login.ssh_user.clone(),
            auth,
            size,
        })
    }

    fn next_connection_id(&self) -> u64 {
        self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    fn track_connection(&self) -> ActiveGuard {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.shared.clone())
    }
}

/// Keeps the active connection count honest however a relay exits.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/terminal", get(terminal))
        .route("/health", get(health))
        .route("/sessions", get(sessions))
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: GatewayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Terminal gateway listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn terminal(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::run(socket, state, params))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn sessions(State(state): State<GatewayState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry().sessions())
}
