//! # Durable Sinks
//!
//! Workflow states are persisted as [`WorkflowStateDocument`]s: enum fields as
//! strings, id sets as sorted lists, timestamps as RFC 3339. A document loaded
//! after a restart converts back into an equal [`WorkflowState`].

use crate::error::{EngineError, EngineResult};
use crate::state::{StepResult, WorkflowState};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultDocument {
    pub step_id: String,
    pub status: String,
    pub output: Option<Value>,
    pub is_valid: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub execution_time_ms: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateDocument {
    pub workflow_id: String,
    pub version: u64,
    pub status: String,
    pub current_step: Option<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub step_results: BTreeMap<String, StepResultDocument>,
    pub error_count: u32,
    pub retry_count: u32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(field: &str, value: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| EngineError::Serialization(format!("invalid {field} '{value}': {e}")))
}

impl From<&StepResult> for StepResultDocument {
    fn from(result: &StepResult) -> Self {
        Self {
            step_id: result.step_id.clone(),
            status: result.status.to_string(),
            output: result.output.clone(),
            is_valid: result.is_valid,
            error: result.error.clone(),
            retry_count: result.retry_count,
            execution_time_ms: result.execution_time_ms,
            timestamp: format_timestamp(&result.timestamp),
        }
    }
}

impl TryFrom<StepResultDocument> for StepResult {
    type Error = EngineError;

    fn try_from(document: StepResultDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            status: document.status.parse().map_err(EngineError::Serialization)?,
            timestamp: parse_timestamp("step timestamp", &document.timestamp)?,
            step_id: document.step_id,
            output: document.output,
            is_valid: document.is_valid,
            error: document.error,
            retry_count: document.retry_count,
            execution_time_ms: document.execution_time_ms,
        })
    }
}

impl From<&WorkflowState> for WorkflowStateDocument {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            version: state.version,
            status: state.status.to_string(),
            current_step: state.current_step.clone(),
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.iter().cloned().collect(),
            skipped: state.skipped.iter().cloned().collect(),
            step_results: state
                .step_results
                .iter()
                .map(|(id, result)| (id.clone(), StepResultDocument::from(result)))
                .collect(),
            error_count: state.error_count,
            retry_count: state.retry_count,
            created_at: format_timestamp(&state.created_at),
            updated_at: format_timestamp(&state.updated_at),
            metadata: state.metadata.clone(),
        }
    }
}

impl TryFrom<WorkflowStateDocument> for WorkflowState {
    type Error = EngineError;

    fn try_from(document: WorkflowStateDocument) -> Result<Self, Self::Error> {
        let step_results = document
            .step_results
            .into_iter()
            .map(|(id, result)| Ok((id, StepResult::try_from(result)?)))
            .collect::<EngineResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            status: document.status.parse().map_err(EngineError::Serialization)?,
            created_at: parse_timestamp("created_at", &document.created_at)?,
            updated_at: parse_timestamp("updated_at", &document.updated_at)?,
            workflow_id: document.workflow_id,
            version: document.version,
            current_step: document.current_step,
            completed: document.completed.into_iter().collect(),
            failed: document.failed.into_iter().collect(),
            skipped: document.skipped.into_iter().collect(),
            step_results,
            error_count: document.error_count,
            retry_count: document.retry_count,
            metadata: document.metadata,
        })
    }
}

/// Durable storage for the latest version of each workflow
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn persist(&self, document: &WorkflowStateDocument) -> EngineResult<()>;

    async fn load(&self, workflow_id: &str) -> EngineResult<Option<WorkflowStateDocument>>;

    fn sink_name(&self) -> &'static str;
}

/// Sink keeping serialized documents in memory
#[derive(Debug, Default)]
pub struct InMemorySink {
    documents: DashMap<String, Value>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DurableSink for InMemorySink {
    async fn persist(&self, document: &WorkflowStateDocument) -> EngineResult<()> {
        let value = serde_json::to_value(document)?;
        self.documents.insert(document.workflow_id.clone(), value);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> EngineResult<Option<WorkflowStateDocument>> {
        let Some(value) = self.documents.get(workflow_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    fn sink_name(&self) -> &'static str {
        "memory"
    }
}

/// Sink writing one pretty-printed JSON file per workflow
#[derive(Debug, Clone)]
pub struct FileSystemSink {
    directory: PathBuf,
}

impl FileSystemSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// One file per workflow id. Bytes outside `[a-z0-9.-]` are written as
    /// `_xx` hex, so distinct ids never share a file, even on
    /// case-insensitive filesystems.
    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let mut file_stem = String::with_capacity(workflow_id.len());
        for byte in workflow_id.bytes() {
            if byte.is_ascii_lowercase() || byte.is_ascii_digit() || matches!(byte, b'-' | b'.') {
                file_stem.push(char::from(byte));
            } else {
                file_stem.push_str(&format!("_{byte:02x}"));
            }
        }
        self.directory.join(format!("{file_stem}.json"))
    }
}

#[async_trait]
impl DurableSink for FileSystemSink {
    async fn persist(&self, document: &WorkflowStateDocument) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| EngineError::Persistence(format!("create {}: {e}", self.directory.display())))?;

        let path = self.path_for(&document.workflow_id);
        let staging = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(document)?;

        tokio::fs::write(&staging, contents)
            .await
            .map_err(|e| EngineError::Persistence(format!("write {}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| EngineError::Persistence(format!("rename to {}: {e}", path.display())))?;

        debug!(
            workflow_id = %document.workflow_id,
            version = document.version,
            path = %path.display(),
            "Persisted workflow state"
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> EngineResult<Option<WorkflowStateDocument>> {
        let path = self.path_for(workflow_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let document: WorkflowStateDocument = serde_json::from_slice(&bytes)?;
                if document.workflow_id != workflow_id {
                    return Err(EngineError::Persistence(format!(
                        "{} holds workflow '{}', expected '{workflow_id}'",
                        path.display(),
                        document.workflow_id
                    )));
                }
                Ok(Some(document))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Persistence(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    fn sink_name(&self) -> &'static str {
        "file"
    }
}
