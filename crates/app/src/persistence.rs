//! On-disk record of test executions.
//!
//! Layout under the workspace root:
//!
//! ```text
//! .prismatic/
//!   types.ts
//!   executions/<execution-id>/execution-metadata.json
//!   executions/<execution-id>/step-<sanitized-name>.json
//! ```

use std::{collections::HashSet, fs, time::SystemTime};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::path_safety::join_under_root;

pub const METADATA_FILE: &str = "execution-metadata.json";
pub const TYPES_FILE: &str = "types.ts";
const STEP_PREFIX: &str = "step-";
const STEP_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResultRecord {
    pub step_name: String,
    pub data: Value,
    pub timestamp: String,
    pub received_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub path: Utf8PathBuf,
    pub step_count: usize,
    pub has_metadata: bool,
}

#[derive(Debug, Clone)]
pub struct ResultPersistence {
    workspace_root: Utf8PathBuf,
}

impl ResultPersistence {
    pub fn new(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn base_dir(&self) -> Utf8PathBuf {
        self.workspace_root.join(".prismatic")
    }

    pub fn executions_dir(&self) -> Utf8PathBuf {
        self.base_dir().join("executions")
    }

    pub fn types_path(&self) -> Utf8PathBuf {
        self.base_dir().join(TYPES_FILE)
    }

    /// Path of an execution directory without touching the file system.
    pub fn execution_dir(&self, execution_id: &str) -> Result<Utf8PathBuf> {
        join_under_root(&self.executions_dir(), execution_id)
            .with_context(|| format!("invalid execution id {execution_id:?}"))
    }

    pub fn create_execution_directory(&self, execution_id: &str) -> Result<Utf8PathBuf> {
        let dir = self.execution_dir(execution_id)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create execution dir {dir}"))?;
        Ok(dir)
    }

    pub fn write_json_file(&self, path: &Utf8Path, data: &impl Serialize) -> Result<()> {
        let json = serde_json::to_string_pretty(data)
            .with_context(|| format!("failed to serialize {path}"))?;
        fs::write(path, json).with_context(|| format!("failed to write {path}"))
    }

    pub fn write_execution_metadata(&self, execution_id: &str, metadata: &Value) -> Result<Utf8PathBuf> {
        let dir = self.create_execution_directory(execution_id)?;
        let path = dir.join(METADATA_FILE);
        self.write_json_file(&path, metadata)?;
        debug!(%execution_id, path = %path, "wrote execution metadata");
        Ok(path)
    }

    /// Records one step result. Re-reporting the same step overwrites its file.
    pub fn write_step_result(
        &self,
        execution_id: &str,
        step_name: &str,
        data: Value,
        timestamp: Option<String>,
    ) -> Result<Utf8PathBuf> {
        let dir = self.create_execution_directory(execution_id)?;
        let path = dir.join(step_file_name(step_name));
        let received_at = now_rfc3339();
        let record = StepResultRecord {
            step_name: step_name.to_owned(),
            data,
            timestamp: timestamp.unwrap_or_else(|| received_at.clone()),
            received_at,
        };
        self.write_json_file(&path, &record)?;
        info!(%execution_id, %step_name, path = %path, "saved step result");
        Ok(path)
    }

    /// Step names of an execution, derived from the step file names, sorted.
    /// A missing directory yields an empty list.
    pub fn list_step_names(&self, execution_id: &str) -> Result<Vec<String>> {
        let dir = self.execution_dir(execution_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in dir
            .read_dir_utf8()
            .with_context(|| format!("failed to read {dir}"))?
        {
            let entry = entry?;
            if let Some(name) = step_name_from_file(entry.file_name()) {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Known executions, most recently modified first.
    pub fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        let root = self.executions_dir();
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in root
            .read_dir_utf8()
            .with_context(|| format!("failed to read {root}"))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let execution_id = entry.file_name().to_owned();
            let path = entry.path().to_owned();
            let step_count = self.list_step_names(&execution_id)?.len();
            found.push((
                modified,
                ExecutionSummary {
                    has_metadata: path.join(METADATA_FILE).exists(),
                    execution_id,
                    path,
                    step_count,
                },
            ));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, summary)| summary).collect())
    }

    pub fn read_step_result(&self, execution_id: &str, step_name: &str) -> Result<StepResultRecord> {
        let path = self.execution_dir(execution_id)?.join(step_file_name(step_name));
        let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {path}"))
    }

    /// Rewrites `types.ts` for `execution_id` from scratch.
    pub fn update_types_file(&self, execution_id: &str, step_names: &[String]) -> Result<Utf8PathBuf> {
        self.execution_dir(execution_id)?;
        fs::create_dir_all(self.base_dir())
            .with_context(|| format!("failed to create {}", self.base_dir()))?;
        let path = self.types_path();
        let source = render_types(execution_id, step_names, &now_rfc3339());
        fs::write(&path, source).with_context(|| format!("failed to write {path}"))?;
        info!(%execution_id, steps = step_names.len(), path = %path, "regenerated step types");
        Ok(path)
    }
}

/// `step-<name>.json` with unsafe characters and whitespace replaced, lowercased.
pub fn step_file_name(step_name: &str) -> String {
    let sanitized: String = step_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_whitespace()
                || c.is_control()
                || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
            {
                '_'
            } else {
                c
            }
        })
        .collect();
    format!("{STEP_PREFIX}{}{STEP_SUFFIX}", sanitized.to_lowercase())
}

pub fn step_name_from_file(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(STEP_PREFIX)?
        .strip_suffix(STEP_SUFFIX)
        .filter(|name| !name.is_empty())
}

fn render_types(execution_id: &str, step_names: &[String], generated_at: &str) -> String {
    let mut seen = HashSet::new();
    let mut imports = String::new();
    let mut members = String::new();
    for name in step_names {
        let mut ident = format!("step_{}", ts_identifier(name));
        let mut suffix = 2;
        while !seen.insert(ident.clone()) {
            ident = format!("step_{}_{suffix}", ts_identifier(name));
            suffix += 1;
        }
        let module = format!("./executions/{execution_id}/{}", step_file_name(name));
        imports.push_str(&format!("import {ident} from {};\n", ts_string(&module)));
        members.push_str(&format!(
            "  {}: (typeof {ident})[\"data\"];\n",
            ts_string(name)
        ));
    }
    let names = step_names
        .iter()
        .map(|name| ts_string(name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "// Generated by prism-bridge from received step results. Do not edit.\n\
         {imports}\n\
         export interface StepResults {{\n{members}}}\n\n\
         export type StepName = keyof StepResults;\n\n\
         export const latestExecution = {{\n  \
           executionId: {execution},\n  \
           generatedAt: {generated},\n  \
           stepCount: {count},\n  \
           stepNames: [{names}],\n\
         }} as const;\n",
        execution = ts_string(execution_id),
        generated = ts_string(generated_at),
        count = step_names.len(),
    )
}

fn ts_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn ts_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn persistence() -> (tempfile::TempDir, ResultPersistence) {
        let temp = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, ResultPersistence::new(root))
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let (_temp, store) = persistence();
        let first = store.create_execution_directory("exec-1").unwrap();
        let second = store.create_execution_directory("exec-1").unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert!(first.ends_with(".prismatic/executions/exec-1"));
    }

    #[test]
    fn same_step_overwrites_previous_result() {
        let (_temp, store) = persistence();
        store
            .write_step_result("exec-1", "Fetch Orders", json!({ "v": 1 }), None)
            .unwrap();
        store
            .write_step_result("exec-1", "fetch orders", json!({ "v": 2 }), None)
            .unwrap();

        let dir = store.execution_dir("exec-1").unwrap();
        let files: Vec<_> = dir.read_dir_utf8().unwrap().collect();
        assert_eq!(files.len(), 1);
        let record = store.read_step_result("exec-1", "fetch orders").unwrap();
        assert_eq!(record.data, json!({ "v": 2 }));
        assert_eq!(record.step_name, "fetch orders");
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(step_file_name("webhook"), "step-webhook.json");
        assert_eq!(step_file_name("Send To: Slack"), "step-send_to__slack.json");
        assert_eq!(step_file_name("a/b\\c"), "step-a_b_c.json");
        assert_eq!(step_name_from_file("step-webhook.json"), Some("webhook"));
        assert_eq!(step_name_from_file(METADATA_FILE), None);
        assert_eq!(step_name_from_file("step-.json"), None);
    }

    #[test]
    fn traversal_ids_never_touch_disk() {
        let (_temp, store) = persistence();
        assert!(store.create_execution_directory("../outside").is_err());
        assert!(
            store
                .write_step_result("..", "auth", json!({}), None)
                .is_err()
        );
        assert!(!store.executions_dir().join("..").join("outside").exists());
    }

    #[test]
    fn step_names_come_from_files() {
        let (_temp, store) = persistence();
        store
            .write_execution_metadata("exec-1", &json!({ "status": "started" }))
            .unwrap();
        store.write_step_result("exec-1", "webhook", json!(1), None).unwrap();
        store.write_step_result("exec-1", "auth", json!(2), None).unwrap();
        assert_eq!(store.list_step_names("exec-1").unwrap(), vec!["auth", "webhook"]);
        assert!(store.list_step_names("exec-missing").unwrap().is_empty());

        let executions = store.list_executions().unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].step_count, 2);
        assert!(executions[0].has_metadata);
    }

    #[test]
    fn types_file_lists_steps_and_is_rewritten() {
        let (_temp, store) = persistence();
        store
            .update_types_file("exec-1", &["webhook".to_string(), "a-b".to_string(), "a_b".to_string()])
            .unwrap();
        let source = fs::read_to_string(store.types_path()).unwrap();
        assert!(source.contains("import step_webhook from \"./executions/exec-1/step-webhook.json\";"));
        assert!(source.contains("import step_a_b_2 from"));
        assert!(source.contains("stepNames: [\"webhook\", \"a-b\", \"a_b\"]"));
        assert!(source.contains("stepCount: 3"));

        store
            .update_types_file("exec-2", &["auth".to_string()])
            .unwrap();
        let source = fs::read_to_string(store.types_path()).unwrap();
        assert!(!source.contains("webhook"));
        assert!(source.contains("executionId: \"exec-2\""));
    }

    #[test]
    fn quoted_execution_ids_are_escaped_in_types() {
        let source = render_types("exec\"1`", &["auth".to_string()], "2024-05-01T00:00:00Z");
        assert!(
            source.contains("import step_auth from \"./executions/exec\\\"1`/step-auth.json\";"),
            "{source}"
        );
        assert!(source.contains("executionId: \"exec\\\"1`\","));
    }

    #[test]
    fn explicit_timestamp_is_preserved() {
        let (_temp, store) = persistence();
        store
            .write_step_result("exec-1", "auth", json!(null), Some("2024-05-01T00:00:00Z".into()))
            .unwrap();
        let record = store.read_step_result("exec-1", "auth").unwrap();
        assert_eq!(record.timestamp, "2024-05-01T00:00:00Z");
        assert!(!record.received_at.is_empty());
    }
}
