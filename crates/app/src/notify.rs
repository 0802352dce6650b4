use std::fmt;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::editor::EditorBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageLevel::Info => "INFO",
            MessageLevel::Success => "SUCCESS",
            MessageLevel::Warn => "WARN",
            MessageLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Logs `message` and, for actions the user started, surfaces anything above
/// INFO through the editor.
pub fn report(editor: &dyn EditorBridge, level: MessageLevel, message: &str, user_initiated: bool) {
    match level {
        MessageLevel::Info | MessageLevel::Success => info!(%level, "{message}"),
        MessageLevel::Warn => warn!("{message}"),
        MessageLevel::Error => error!("{message}"),
    }
    if user_initiated && level != MessageLevel::Info {
        editor.show_message(level, message);
    }
}
