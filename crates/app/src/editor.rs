use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::notify::MessageLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceFolder {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub folders: Vec<WorkspaceFolder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorInfo {
    pub file_name: String,
    pub language_id: String,
    pub line_count: usize,
    pub is_dirty: bool,
}

/// The editor-side surface the bridge calls into.
#[async_trait]
pub trait EditorBridge: Send + Sync {
    fn workspace(&self) -> WorkspaceInfo;
    fn active_editor(&self) -> Option<EditorInfo>;
    async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value>;
    /// Asks the user to finish configuring an instance before testing.
    async fn open_configuration(&self, integration_id: &str, system_instance_id: Option<&str>) -> Result<()>;
    fn show_message(&self, level: MessageLevel, message: &str);
}

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type CommandHandler = Arc<dyn Fn(Vec<Value>) -> CommandFuture + Send + Sync>;

/// Editor bridge for terminal use: commands come from a registry, messages go
/// to stdout and are kept for inspection.
pub struct HeadlessEditor {
    workspace: WorkspaceInfo,
    commands: RwLock<HashMap<String, CommandHandler>>,
    messages: Mutex<Vec<(MessageLevel, String)>>,
    echo: bool,
}

impl HeadlessEditor {
    pub fn new(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self::build(name.into(), root.into(), true)
    }

    /// Same as `new` but never prints.
    pub fn quiet(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self::build(name.into(), root.into(), false)
    }

    fn build(name: String, root: String, echo: bool) -> Self {
        Self {
            workspace: WorkspaceInfo {
                folders: vec![WorkspaceFolder {
                    name: name.clone(),
                    path: root,
                }],
                name,
            },
            commands: RwLock::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
            echo,
        }
    }

    pub fn register_command<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.commands.write().insert(name.to_owned(), handler);
    }

    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl EditorBridge for HeadlessEditor {
    fn workspace(&self) -> WorkspaceInfo {
        self.workspace.clone()
    }

    fn active_editor(&self) -> Option<EditorInfo> {
        None
    }

    async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        let handler = self
            .commands
            .read()
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow!("command '{command}' not found"))?;
        handler(args).await
    }

    async fn open_configuration(&self, integration_id: &str, system_instance_id: Option<&str>) -> Result<()> {
        info!(%integration_id, ?system_instance_id, "integration requires configuration");
        self.show_message(
            MessageLevel::Warn,
            &format!(
                "Integration {integration_id} is not fully configured. Finish its configuration in Prismatic, then run the test again."
            ),
        );
        Ok(())
    }

    fn show_message(&self, level: MessageLevel, message: &str) {
        if self.echo {
            println!("[{level}] {message}");
        }
        self.messages.lock().push((level, message.to_owned()));
    }
}
