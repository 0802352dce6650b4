use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::state::{SharedStateStore, keys};

pub mod providers;

pub use providers::{ProcessTunnel, cloudflared, ngrok};

pub const LOCALHOST_PROVIDER: &str = "localhost";

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn is_available(&self) -> bool;
    /// Opens a tunnel to `port`, resolving to its public URL.
    async fn connect(&self, port: u16) -> Result<String, TunnelError>;
    async fn disconnect(&self) -> Result<(), TunnelError>;
}

struct ActiveTunnel {
    provider: Option<Arc<dyn TunnelProvider>>,
    provider_name: String,
    public_url: String,
}

/// Tries providers in order and remembers which one is serving.
pub struct TunnelManager {
    providers: Vec<Arc<dyn TunnelProvider>>,
    active: Mutex<Option<ActiveTunnel>>,
    storage: SharedStateStore,
    connect_timeout: Duration,
}

impl TunnelManager {
    pub fn new(
        providers: Vec<Arc<dyn TunnelProvider>>,
        storage: SharedStateStore,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            active: Mutex::new(None),
            storage,
            connect_timeout,
        }
    }

    /// Builds the provider list named in config; unknown names are skipped.
    pub fn from_config(config: &TunnelConfig, storage: SharedStateStore) -> Self {
        let timeout = config.connect_timeout();
        let providers = if config.enabled {
            config
                .providers
                .iter()
                .filter_map(|name| match name.as_str() {
                    "cloudflared" => Some(Arc::new(cloudflared(timeout)) as Arc<dyn TunnelProvider>),
                    "ngrok" => Some(Arc::new(ngrok(timeout)) as Arc<dyn TunnelProvider>),
                    other => {
                        warn!(provider = other, "ignoring unknown tunnel provider");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Self::new(providers, storage, timeout)
    }

    /// Never fails: when no provider connects the local URL is used instead.
    pub async fn create_tunnel(&self, port: u16) -> String {
        for provider in &self.providers {
            let name = provider.name().to_string();
            if !provider.is_available().await {
                info!(provider = %name, "tunnel provider unavailable, trying next");
                continue;
            }
            let attempt = tokio::time::timeout(self.connect_timeout, provider.connect(port)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => {
                    let _ = provider.disconnect().await;
                    Err(TunnelError::Timeout {
                        provider: name.clone(),
                        seconds: self.connect_timeout.as_secs(),
                    })
                }
            };
            match result {
                Ok(url) => {
                    info!(provider = %name, %url, port, "tunnel established");
                    self.record(Some(provider.clone()), name, url.clone());
                    return url;
                }
                Err(err) => warn!(provider = %name, %err, "tunnel provider failed"),
            }
        }

        let url = format!("http://localhost:{port}");
        warn!(port, %url, "no tunnel provider connected; using local url");
        self.record(None, LOCALHOST_PROVIDER.to_string(), url.clone());
        url
    }

    fn record(&self, provider: Option<Arc<dyn TunnelProvider>>, provider_name: String, public_url: String) {
        if let Err(err) = self
            .storage
            .set(keys::TUNNEL_URL, Value::String(public_url.clone()))
            .and_then(|_| {
                self.storage
                    .set(keys::TUNNEL_PROVIDER, Value::String(provider_name.clone()))
            })
        {
            warn!(?err, "failed to persist tunnel details");
        }
        *self.active.lock() = Some(ActiveTunnel {
            provider,
            provider_name,
            public_url,
        });
    }

    /// Disconnect errors are logged and swallowed.
    pub async fn close_tunnel(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        if let Some(provider) = active.provider
            && let Err(err) = provider.disconnect().await
        {
            warn!(provider = %active.provider_name, %err, "tunnel disconnect failed");
        }
        for key in [keys::TUNNEL_URL, keys::TUNNEL_PROVIDER] {
            if let Err(err) = self.storage.remove(key) {
                warn!(key, ?err, "failed to clear stored tunnel details");
            }
        }
        info!(provider = %active.provider_name, "tunnel closed");
    }

    pub fn public_url(&self) -> Option<String> {
        self.active.lock().as_ref().map(|t| t.public_url.clone())
    }

    pub fn active_provider(&self) -> Option<String> {
        self.active.lock().as_ref().map(|t| t.provider_name.clone())
    }
}
