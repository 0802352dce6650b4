//! Loopback HTTP server that receives step results from remote test executions.

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{Mutex as AsyncMutex, broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::editor::EditorBridge;
use crate::persistence::ResultPersistence;
use crate::state::{SharedStateStore, keys};
use crate::tunnel::TunnelManager;

pub mod auth;
pub mod routes;

pub use routes::{EXTENSION_NAME, ServerState, build_router};

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct CallbackServer {
    config: ServerConfig,
    storage: SharedStateStore,
    persistence: Arc<ResultPersistence>,
    editor: Arc<dyn EditorBridge>,
    tunnels: Arc<TunnelManager>,
    executions: Arc<Mutex<HashSet<String>>>,
    completions: broadcast::Sender<String>,
    running: Mutex<Option<RunningServer>>,
    lifecycle: AsyncMutex<()>,
}

impl CallbackServer {
    pub fn new(
        config: ServerConfig,
        storage: SharedStateStore,
        persistence: Arc<ResultPersistence>,
        editor: Arc<dyn EditorBridge>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        let (completions, _) = broadcast::channel(32);
        Self {
            config,
            storage,
            persistence,
            editor,
            tunnels,
            executions: Arc::new(Mutex::new(HashSet::new())),
            completions,
            running: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// Current callback token, creating and storing one on first use.
    pub fn ensure_auth_token(&self) -> Result<String> {
        if let Some(token) = self.storage.get_string(keys::CALLBACK_TOKEN) {
            return Ok(token);
        }
        let token = auth::generate_token();
        self.storage
            .set(keys::CALLBACK_TOKEN, Value::String(token.clone()))
            .context("failed to persist callback token")?;
        info!("generated new callback auth token");
        Ok(token)
    }

    pub fn auth_token(&self) -> Option<String> {
        self.storage.get_string(keys::CALLBACK_TOKEN)
    }

    /// Router bound to the current token, also used directly by tests.
    pub fn router(&self) -> Result<Router> {
        let token = self.ensure_auth_token()?;
        Ok(build_router(ServerState {
            auth: auth::CallbackAuth::new(token),
            persistence: self.persistence.clone(),
            editor: self.editor.clone(),
            started_at: Instant::now(),
            executions: self.executions.clone(),
            completions: self.completions.clone(),
        }))
    }

    /// Binds and serves; a second call while running returns the existing port.
    pub async fn start(&self) -> Result<u16> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(port) = self.port() {
            return Ok(port);
        }

        let router = self.router()?;
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.host))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener
            .local_addr()
            .context("failed to read bound address")?
            .port();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                error!(?err, "callback server exited with an error");
            }
        });
        *self.running.lock() = Some(RunningServer {
            port,
            shutdown,
            task,
        });
        info!(port, "callback server listening");

        let public_url = self.tunnels.create_tunnel(port).await;
        info!(port, %public_url, "callback server reachable");
        Ok(port)
    }

    /// Stops serving and closes any tunnel. Harmless when not running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            if let Err(err) = running.task.await {
                warn!(?err, "callback server task ended abnormally");
            }
            info!(port = running.port, "callback server stopped");
        }
        self.tunnels.close_tunnel().await;
    }

    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|running| running.port)
    }

    pub fn is_server_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.port != 0 && !running.task.is_finished())
    }

    pub fn local_url(&self) -> Option<String> {
        self.port().map(|port| format!("http://localhost:{port}"))
    }

    /// Tunnel URL when one is active, otherwise the loopback URL.
    pub fn public_url(&self) -> Option<String> {
        if !self.is_server_running() {
            return None;
        }
        self.tunnels
            .public_url()
            .filter(|url| !url.contains("localhost"))
            .or_else(|| self.local_url())
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<String> {
        self.completions.subscribe()
    }

    pub fn persistence(&self) -> &Arc<ResultPersistence> {
        &self.persistence
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }
}
