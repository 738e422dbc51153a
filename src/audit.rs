//! Audit Log
//!
//! One append-only record per terminal turn outcome (answer or error).
//! Clarification prompts are not terminal and are never recorded.

use crate::error::{NlqError, Result};
use crate::error_classifier::ErrorClass;
use crate::executor::Row;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Pipeline stage a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Generation,
    Validation,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFailure {
    pub stage: FailureStage,
    pub classification: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub channel: String,
    pub original_message: String,
    pub generated_query: Option<String>,
    pub rows: Option<Vec<Row>>,
    pub error: Option<AuditFailure>,
    pub execution_time_ms: u64,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, channel: impl Into<String>, original_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            channel: channel.into(),
            original_message: original_message.into(),
            generated_query: None,
            rows: None,
            error: None,
            execution_time_ms: 0,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.generated_query = Some(query.into());
        self
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_error(mut self, stage: FailureStage, classification: ErrorClass, message: impl Into<String>) -> Self {
        self.error = Some(AuditFailure {
            stage,
            classification,
            message: message.into(),
        });
        self
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }
}

/// Outcome counts over a set of audit records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub errors: usize,
    pub successes: usize,
    /// Errors as a whole percentage of the total, 0 when empty
    pub error_rate: u32,
}

impl AuditSummary {
    pub fn from_records(records: &[AuditRecord]) -> Self {
        let total = records.len();
        let errors = records.iter().filter(|r| r.error.is_some()).count();
        let error_rate = if total == 0 {
            0
        } else {
            ((errors as f64 / total as f64) * 100.0).round() as u32
        };
        Self {
            total,
            errors,
            successes: total - errors,
            error_rate,
        }
    }
}

/// Append-only store for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;
}

/// Keeps records in memory; used by tests and the CLI when no log file is set
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|e| NlqError::Audit(format!("Audit buffer poisoned: {}", e)))?
            .push(record);
        Ok(())
    }
}

/// Writes one JSON object per line
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read back every record in the file
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(NlqError::from))
            .collect()
    }

    pub fn summary(&self) -> Result<AuditSummary> {
        Ok(AuditSummary::from_records(&self.read_all()?))
    }

    /// Newest records first, skipping `offset`
    pub fn recent(&self, offset: usize, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records = self.read_all()?;
        records.reverse();
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| NlqError::Audit(format!("Audit file lock poisoned: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| NlqError::Audit(format!("Failed to open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_sink_appends() {
        let sink = InMemoryAuditSink::new();
        sink.append(AuditRecord::new("u1", "cli", "how many users?").with_query("SELECT COUNT(*) FROM users"))
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].generated_query.as_deref(), Some("SELECT COUNT(*) FROM users"));
        assert!(records[0].error.is_none());
    }

    #[tokio::test]
    async fn test_jsonl_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"));

        let mut row = Row::new();
        row.insert("count".to_string(), json!(3));
        sink.append(AuditRecord::new("u1", "slack", "count users").with_rows(vec![row]))
            .await
            .unwrap();
        sink.append(
            AuditRecord::new("u2", "slack", "delete users")
                .with_query("DELETE FROM users")
                .with_error(FailureStage::Validation, ErrorClass::UnsafeQuery, "Only SELECT queries are allowed"),
        )
        .await
        .unwrap();

        let records = sink.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rows.as_ref().unwrap()[0]["count"], json!(3));

        let failure = records[1].error.as_ref().unwrap();
        assert_eq!(failure.stage, FailureStage::Validation);
        assert_eq!(failure.classification, ErrorClass::UnsafeQuery);

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        assert!(raw.contains("\"stage\":\"validation\""));
        assert!(raw.contains("\"classification\":\"UNSAFE_QUERY\""));
    }

    #[tokio::test]
    async fn test_jsonl_summary_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"));
        assert_eq!(sink.summary().unwrap(), AuditSummary::default());

        for question in ["q1", "q2", "q3"] {
            sink.append(AuditRecord::new("u1", "cli", question)).await.unwrap();
        }
        sink.append(
            AuditRecord::new("u1", "cli", "q4").with_error(FailureStage::Execution, ErrorClass::Unknown, "statement timeout"),
        )
        .await
        .unwrap();

        let summary = sink.summary().unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.successes, 3);
        assert_eq!(summary.error_rate, 25);

        let page: Vec<String> = sink.recent(1, 2).unwrap().into_iter().map(|r| r.original_message).collect();
        assert_eq!(page, ["q3", "q2"]);
        assert!(sink.recent(10, 5).unwrap().is_empty());
    }
}
