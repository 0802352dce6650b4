//! Keeps the active integration agreeing across the workspace marker file, the
//! persisted workspace state and the last snapshot loaded from Prismatic.

use std::{fs, sync::Arc};

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::credentials::CredentialStore;
use crate::graphql::{RemoteQueryExecutor, operations};
use crate::state::{SharedStateStore, keys};

pub const MARKER_DIR: &str = ".spectral";
pub const MARKER_FILE: &str = "prism.json";

/// What a consistency check found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyOutcome {
    Consistent,
    Empty,
    SnapshotReloaded,
    Repaired,
    Cleared,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveIntegration {
    pub integration_id: Option<String>,
    pub path: Option<Utf8PathBuf>,
    pub snapshot: Option<Value>,
    pub flow_id: Option<String>,
    pub config_state: Option<String>,
}

pub fn marker_path(integration_dir: &Utf8Path) -> Utf8PathBuf {
    integration_dir.join(MARKER_DIR).join(MARKER_FILE)
}

/// Reads `integrationId` from the marker file under `integration_dir`.
pub fn read_marker(integration_dir: &Utf8Path) -> Result<String> {
    let path = marker_path(integration_dir);
    let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
    let marker: Value =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {path}"))?;
    marker
        .get("integrationId")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("{path} has no integrationId"))
}

/// Writes `integrationId` into the marker file, keeping any other keys.
pub fn write_marker(integration_dir: &Utf8Path, integration_id: &str) -> Result<Utf8PathBuf> {
    let path = marker_path(integration_dir);
    let mut marker = fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
        .unwrap_or_default();
    marker.insert(
        "integrationId".to_owned(),
        Value::String(integration_id.to_owned()),
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {parent}"))?;
    }
    let json = serde_json::to_string_pretty(&Value::Object(marker))?;
    fs::write(&path, json).with_context(|| format!("failed to write {path}"))?;
    Ok(path)
}

pub struct IntegrationConsistencyManager {
    storage: SharedStateStore,
    executor: Arc<dyn RemoteQueryExecutor>,
    credentials: Arc<CredentialStore>,
}

impl IntegrationConsistencyManager {
    pub fn new(
        storage: SharedStateStore,
        executor: Arc<dyn RemoteQueryExecutor>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            storage,
            executor,
            credentials,
        }
    }

    pub fn active(&self) -> ActiveIntegration {
        ActiveIntegration {
            integration_id: self.storage.get_string(keys::INTEGRATION_ID),
            path: self
                .storage
                .get_string(keys::ACTIVE_INTEGRATION_PATH)
                .map(Utf8PathBuf::from),
            snapshot: self
                .storage
                .get(keys::LOADED_SNAPSHOT)
                .filter(|snapshot| !snapshot.is_null()),
            flow_id: self.storage.get_string(keys::FLOW_ID),
            config_state: self.storage.get_string(keys::CONFIG_STATE),
        }
    }

    /// Makes the integration under `path` active, reloads its snapshot and
    /// verifies the result.
    pub async fn set_active_integration(&self, path: &Utf8Path) -> Result<ConsistencyOutcome> {
        if let Err(err) = self.apply_path(path).await {
            self.clear()?;
            return Err(err);
        }
        self.check_consistency().await
    }

    /// Writes the marker for `integration_id` first, then activates it.
    pub async fn link_integration(
        &self,
        path: &Utf8Path,
        integration_id: &str,
    ) -> Result<ConsistencyOutcome> {
        let marker = write_marker(path, integration_id)?;
        info!(%integration_id, marker = %marker, "wrote integration marker");
        self.set_active_integration(path).await
    }

    pub async fn check_consistency(&self) -> Result<ConsistencyOutcome> {
        let active = self.active();
        if active.integration_id.is_none() && active.path.is_none() && active.snapshot.is_none() {
            return Ok(ConsistencyOutcome::Empty);
        }

        if let (Some(integration_id), Some(path), Some(snapshot)) =
            (&active.integration_id, &active.path, &active.snapshot)
        {
            match read_marker(path) {
                Ok(marker_id) if marker_id == *integration_id => {}
                Ok(marker_id) => {
                    warn!(%integration_id, %marker_id, path = %path, "marker names another integration");
                    return self.replay(path).await;
                }
                Err(err) => {
                    warn!(%integration_id, path = %path, ?err, "integration marker unreadable");
                    return self.replay(path).await;
                }
            }

            let snapshot_id = snapshot.get("id").and_then(Value::as_str);
            if snapshot_id == Some(integration_id.as_str()) {
                return Ok(ConsistencyOutcome::Consistent);
            }
            warn!(%integration_id, ?snapshot_id, "loaded snapshot belongs to another integration");
            return match self.reload_snapshot(integration_id).await {
                Ok(()) => Ok(ConsistencyOutcome::SnapshotReloaded),
                Err(err) => {
                    error!(%integration_id, ?err, "failed to reload integration snapshot");
                    self.clear()?;
                    Ok(ConsistencyOutcome::Cleared)
                }
            };
        }

        error!(
            integration_id = ?active.integration_id,
            path = ?active.path,
            has_snapshot = active.snapshot.is_some(),
            "active integration state is partially set"
        );
        match &active.path {
            Some(path) => self.replay(path).await,
            None => {
                self.clear()?;
                Ok(ConsistencyOutcome::Cleared)
            }
        }
    }

    /// Re-applies the integration under `path`, clearing everything on failure.
    async fn replay(&self, path: &Utf8Path) -> Result<ConsistencyOutcome> {
        match self.apply_path(path).await {
            Ok(()) => {
                info!(path = %path, "active integration restored");
                Ok(ConsistencyOutcome::Repaired)
            }
            Err(err) => {
                error!(path = %path, ?err, "failed to restore active integration");
                self.clear()?;
                Ok(ConsistencyOutcome::Cleared)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        for key in [
            keys::INTEGRATION_ID,
            keys::ACTIVE_INTEGRATION_PATH,
            keys::LOADED_SNAPSHOT,
            keys::FLOW_ID,
            keys::CONFIG_STATE,
        ] {
            self.storage.remove(key)?;
        }
        info!("active integration cleared");
        Ok(())
    }

    async fn apply_path(&self, path: &Utf8Path) -> Result<()> {
        let integration_id = read_marker(path)?;
        self.storage
            .set(keys::INTEGRATION_ID, Value::String(integration_id.clone()))?;
        self.storage
            .set(keys::ACTIVE_INTEGRATION_PATH, Value::String(path.to_string()))?;
        self.storage.remove(keys::LOADED_SNAPSHOT)?;
        self.reload_snapshot(&integration_id).await?;
        info!(%integration_id, path = %path, "active integration set");
        Ok(())
    }

    async fn reload_snapshot(&self, integration_id: &str) -> Result<()> {
        let session = self.credentials.require_session()?;
        let data = self
            .executor
            .execute(&session, operations::get_integration(integration_id))
            .await?;
        let summary = operations::parse_integration(&data)?;
        if summary.id != integration_id {
            return Err(anyhow!(
                "snapshot for {integration_id} came back as {}",
                summary.id
            ));
        }
        self.storage.set(keys::LOADED_SNAPSHOT, summary.raw)?;
        self.storage.set_optional(
            keys::FLOW_ID,
            summary.initial_flow.map(|flow| Value::String(flow.id)),
        )?;
        self.storage
            .set_optional(keys::CONFIG_STATE, summary.config_state.map(Value::String))?;
        Ok(())
    }
}
