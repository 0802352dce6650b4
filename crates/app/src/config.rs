use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const APP_NAME: &str = "prism-bridge";
pub const DEFAULT_SERVICE_URL: &str = "https://app.prismatic.io";

static DEFAULT_CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::default);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub test_run: TestRunConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_url")]
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_URL.into()
}

fn default_request_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: Utf8PathBuf,
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            name: None,
        }
    }
}

impl WorkspaceConfig {
    /// Display name for the workspace, falling back to the root directory name.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.root.file_name().map(str::to_owned))
            .unwrap_or_else(|| "workspace".into())
    }

    pub fn state_path(&self) -> Utf8PathBuf {
        self.root.join(".prismatic/state/workspace.json")
    }
}

fn default_workspace_root() -> Utf8PathBuf {
    Utf8PathBuf::from(".")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Zero binds an OS-assigned ephemeral port.
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: default_providers(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_providers() -> Vec<String> {
    vec!["cloudflared".into(), "ngrok".into()]
}

fn default_connect_timeout() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// When set, the remote execution status is polled at this interval and the
    /// result sync starts as soon as the execution reports it has ended.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            poll_interval_secs: None,
        }
    }
}

fn default_grace_period() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_cli_binary")]
    pub binary: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: default_cli_binary(),
        }
    }
}

fn default_cli_binary() -> String {
    "prism".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub global_path: Option<Utf8PathBuf>,
}

impl StateConfig {
    pub fn resolve_global_path(&self, workspace: &WorkspaceConfig) -> Utf8PathBuf {
        if let Some(path) = &self.global_path {
            return path.clone();
        }
        ProjectDirs::from("io", "Prismatic", APP_NAME)
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("global-state.json")).ok()
            })
            .unwrap_or_else(|| workspace.root.join(".prismatic/state/global.json"))
    }
}

pub fn load_config(
    explicit_path: Option<&Utf8PathBuf>,
    workspace_root: Option<&Utf8Path>,
) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(DEFAULT_CONFIG.clone()));

    if let Some(path) = explicit_path {
        figment = figment.merge(Toml::file(path));
    } else if let Some(path) = resolve_default_config_path(workspace_root) {
        figment = figment.merge(Toml::file(path));
    } else {
        warn!("no config file found; relying on defaults + env overrides");
    }

    figment = figment.merge(Env::prefixed("PRISM_BRIDGE_").split("__"));

    let mut config: AppConfig = figment
        .extract()
        .context("failed to load prism-bridge configuration")?;
    if let Some(root) = workspace_root {
        config.workspace.root = root.to_owned();
    }
    Ok(config)
}

fn resolve_default_config_path(workspace_root: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
    let root = workspace_root.unwrap_or_else(|| Utf8Path::new("."));
    let workspace_relative = root.join(".prismatic/bridge.toml");
    if workspace_relative.exists() {
        return Some(workspace_relative);
    }

    if let Some(dirs) = ProjectDirs::from("io", "Prismatic", APP_NAME)
        && let Ok(path) = Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.toml"))
        && path.exists()
    {
        return Some(path);
    }

    None
}
