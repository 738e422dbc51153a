//! Query Executor
//!
//! Runs a `ValidatedQuery` through a `DatabaseAdapter` with a statement
//! timeout and a row cap, normalizes the rows for JSON transport and
//! classifies failures into the error taxonomy. Never retries.

use crate::error_classifier::{ErrorClass, ErrorClassifier};
use crate::schema::ConnectionRef;
use crate::validation::ValidatedQuery;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One result row, columns in the order the database returned them
pub type Row = serde_json::Map<String, Value>;

/// Largest integer a JSON consumer can represent exactly (2^53 - 1)
const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Raw failure reported by an adapter; classified by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        AdapterError::new(err.to_string())
    }
}

/// Limits applied to every statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub statement_timeout: Duration,
    pub max_rows: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            max_rows: 1000,
        }
    }
}

/// Thin adapter over an external store.
///
/// Implementations receive text that already passed read-only validation and
/// should apply `limits` on their side as well.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    async fn run(
        &self,
        connection: &ConnectionRef,
        text: &str,
        limits: &ExecutionLimits,
    ) -> std::result::Result<Vec<Row>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        rows: Vec<Row>,
        truncated: bool,
    },
    Error {
        classification: ErrorClass,
        message: String,
        detail: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

pub struct QueryExecutor {
    adapter: Arc<dyn DatabaseAdapter>,
    limits: ExecutionLimits,
    classifier: ErrorClassifier,
}

impl QueryExecutor {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            limits: ExecutionLimits::default(),
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub async fn execute(&self, connection: &ConnectionRef, query: &ValidatedQuery) -> ExecutionOutcome {
        let start = Instant::now();
        let call = self.adapter.run(connection, query.text(), &self.limits);

        let result = match tokio::time::timeout(self.limits.statement_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    connection = %connection,
                    timeout_ms = self.limits.statement_timeout.as_millis() as u64,
                    "Statement timed out"
                );
                return ExecutionOutcome::Error {
                    classification: ErrorClass::Unknown,
                    message: format!(
                        "Query timed out after {}ms",
                        self.limits.statement_timeout.as_millis()
                    ),
                    detail: None,
                };
            }
        };

        match result {
            Ok(mut rows) => {
                let truncated = rows.len() > self.limits.max_rows;
                rows.truncate(self.limits.max_rows);
                let rows: Vec<Row> = rows.into_iter().map(normalize_row).collect();
                info!(
                    connection = %connection,
                    rows = rows.len(),
                    truncated,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "✅ Query executed"
                );
                ExecutionOutcome::Success { rows, truncated }
            }
            Err(err) => {
                let classified = self.classifier.classify(&err.message);
                warn!(
                    connection = %connection,
                    classification = %classified.class,
                    "Query failed: {}",
                    err.message
                );
                ExecutionOutcome::Error {
                    classification: classified.class,
                    message: err.message,
                    detail: classified.detail,
                }
            }
        }
    }
}

/// Replace integers a JSON client would lose precision on with decimal strings
pub fn normalize_row(row: Row) -> Row {
    row.into_iter().map(|(k, v)| (k, normalize_value(v))).collect()
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            // Digits beyond u64/i64 only survive parsing as text, so an
            // integer neither accessor can read is unsafe too
            let unsafe_int = match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => i.unsigned_abs() > MAX_SAFE_INTEGER,
                (None, Some(u)) => u > MAX_SAFE_INTEGER,
                (None, None) => is_integer_literal(&n.to_string()),
            };
            if unsafe_int {
                Value::String(n.to_string())
            } else {
                Value::Number(n)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(normalize_row(map)),
        other => other,
    }
}

fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Dialect;
    use crate::validation::QueryValidator;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        rows: usize,
        error: Option<String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn rows(n: usize) -> Self {
            Self { rows: n, error: None, delay: None, calls: AtomicUsize::new(0) }
        }

        fn failing(message: &str) -> Self {
            Self { rows: 0, error: Some(message.to_string()), delay: None, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl DatabaseAdapter for FakeAdapter {
        async fn run(
            &self,
            _connection: &ConnectionRef,
            _text: &str,
            _limits: &ExecutionLimits,
        ) -> std::result::Result<Vec<Row>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.error {
                return Err(AdapterError::new(message.clone()));
            }
            Ok((0..self.rows)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("id".to_string(), json!(i));
                    row
                })
                .collect())
        }
    }

    fn query() -> ValidatedQuery {
        QueryValidator::validate("SELECT id FROM users", Dialect::Relational).unwrap()
    }

    fn connection() -> ConnectionRef {
        ConnectionRef::new("test", Dialect::Relational)
    }

    #[tokio::test]
    async fn test_rows_are_capped() {
        let executor = QueryExecutor::new(Arc::new(FakeAdapter::rows(5))).with_limits(ExecutionLimits {
            statement_timeout: Duration::from_secs(1),
            max_rows: 3,
        });

        match executor.execute(&connection(), &query()).await {
            ExecutionOutcome::Success { rows, truncated } => {
                assert_eq!(rows.len(), 3);
                assert!(truncated);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_relation_is_classified() {
        let adapter = Arc::new(FakeAdapter::failing("relation \"orderz\" does not exist"));
        let executor = QueryExecutor::new(adapter.clone());

        match executor.execute(&connection(), &query()).await {
            ExecutionOutcome::Error { classification, detail, .. } => {
                assert_eq!(classification, ErrorClass::RelationNotFound);
                assert_eq!(detail.as_deref(), Some("orderz"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unknown() {
        let adapter = FakeAdapter {
            delay: Some(Duration::from_millis(200)),
            ..FakeAdapter::rows(1)
        };
        let executor = QueryExecutor::new(Arc::new(adapter)).with_limits(ExecutionLimits {
            statement_timeout: Duration::from_millis(20),
            max_rows: 10,
        });

        match executor.execute(&connection(), &query()).await {
            ExecutionOutcome::Error { classification, message, .. } => {
                assert_eq!(classification, ErrorClass::Unknown);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected timeout error, got {:?}", other),
        }
    }

    #[test]
    fn test_normalize_large_integers() {
        let mut row = Row::new();
        row.insert("small".to_string(), json!(42));
        row.insert("big".to_string(), json!(9_007_199_254_740_993u64));
        row.insert("negative".to_string(), json!(-9_007_199_254_740_993i64));
        row.insert("nested".to_string(), json!([1, 18_446_744_073_709_551_615u64]));

        let normalized = normalize_row(row);
        assert_eq!(normalized["small"], json!(42));
        assert_eq!(normalized["big"], json!("9007199254740993"));
        assert_eq!(normalized["negative"], json!("-9007199254740993"));
        assert_eq!(normalized["nested"], json!([1, "18446744073709551615"]));

        let keys: Vec<&String> = normalized.keys().collect();
        assert_eq!(keys, ["small", "big", "negative", "nested"]);
    }

    #[test]
    fn test_normalize_integers_beyond_u64() {
        let row: Row =
            serde_json::from_str(r#"{"total": 123456789012345678901234, "low": -98765432109876543210, "ratio": 0.5}"#)
                .unwrap();
        let normalized = normalize_row(row);
        assert_eq!(normalized["total"], json!("123456789012345678901234"));
        assert_eq!(normalized["low"], json!("-98765432109876543210"));
        assert_eq!(normalized["ratio"], json!(0.5));
    }
}
