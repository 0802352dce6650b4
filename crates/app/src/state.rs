use std::{collections::BTreeMap, fs, sync::Arc};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

pub mod keys {
    pub const CALLBACK_TOKEN: &str = "prismatic.server.authToken";
    pub const TUNNEL_URL: &str = "prismatic.tunnel.publicUrl";
    pub const TUNNEL_PROVIDER: &str = "prismatic.tunnel.provider";
    pub const INTEGRATION_ID: &str = "prismatic.integrationId";
    pub const ACTIVE_INTEGRATION_PATH: &str = "prismatic.activeIntegrationPath";
    pub const FLOW_ID: &str = "prismatic.flowId";
    pub const CONFIG_STATE: &str = "prismatic.configState";
    pub const LOADED_SNAPSHOT: &str = "prismatic.loadedSnapshot";
    pub const ACCESS_TOKEN: &str = "prismatic.accessToken";
    pub const REFRESH_TOKEN: &str = "prismatic.refreshToken";
    pub const SERVICE_URL: &str = "prismatic.serviceUrl";
}

/// Emitted after every mutation; `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: String,
    pub value: Option<Value>,
}

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|value| value.as_str().map(str::to_owned))
            .filter(|value| !value.is_empty())
    }

    fn set_optional(&self, key: &str, value: Option<Value>) -> Result<()> {
        match value {
            Some(value) => self.set(key, value),
            None => self.remove(key),
        }
    }
}

pub type SharedStateStore = Arc<dyn StateStore>;

pub struct InMemoryStateStore {
    inner: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StateChange>,
}

impl InMemoryStateStore {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: Mutex::new(BTreeMap::new()),
            changes,
        })
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.lock().insert(key.to_owned(), value.clone());
        let _ = self.changes.send(StateChange {
            key: key.to_owned(),
            value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.inner.lock().remove(key).is_some() {
            let _ = self.changes.send(StateChange {
                key: key.to_owned(),
                value: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

/// Key-value state mirrored to a pretty-printed JSON object on disk.
pub struct FileStateStore {
    path: Utf8PathBuf,
    inner: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StateChange>,
}

impl FileStateStore {
    pub fn new(path: Utf8PathBuf) -> Result<Arc<Self>> {
        let data = Self::load_from_disk(&path)?;
        let (changes, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            path,
            inner: Mutex::new(data),
            changes,
        }))
    }

    fn load_from_disk(path: &Utf8PathBuf) -> Result<BTreeMap<String, Value>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw =
            fs::read_to_string(path).with_context(|| format!("failed to read state file {path}"))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {path}"))
    }

    fn persist(&self, guard: &BTreeMap<String, Value>) -> Result<()> {
        let json = serde_json::to_string_pretty(guard)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {parent}"))?;
        }
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write state file {}", self.path))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        {
            let mut guard = self.inner.lock();
            let mut next = guard.clone();
            next.insert(key.to_owned(), value.clone());
            self.persist(&next)?;
            *guard = next;
        }
        let _ = self.changes.send(StateChange {
            key: key.to_owned(),
            value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut guard = self.inner.lock();
            let mut next = guard.clone();
            let removed = next.remove(key).is_some();
            if removed {
                self.persist(&next)?;
                *guard = next;
            }
            removed
        };
        if removed {
            let _ = self.changes.send(StateChange {
                key: key.to_owned(),
                value: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
