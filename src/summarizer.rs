//! Result Summarizer
//!
//! Asks a model for a short natural-language reading of the rows. When no
//! model is configured, or it times out, errors or returns nothing, a
//! deterministic summary is produced instead. Summarization never fails.

use crate::executor::Row;
use crate::llm::{CompletionRequest, ModelProvider};
use crate::prompts;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rows included in the summary prompt
const PROMPT_ROW_LIMIT: usize = 50;

pub struct ResultSummarizer {
    provider: Option<Arc<dyn ModelProvider>>,
    timeout: Duration,
}

impl ResultSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
        }
    }

    /// Summarizer that only produces the deterministic summary
    pub fn deterministic() -> Self {
        Self {
            provider: None,
            timeout: Duration::from_secs(0),
        }
    }

    pub async fn summarize(&self, query: &str, rows: &[Row], question: &str) -> String {
        let Some(provider) = &self.provider else {
            return fallback_summary(rows);
        };

        let shown = &rows[..rows.len().min(PROMPT_ROW_LIMIT)];
        let rows_json = serde_json::to_string_pretty(shown).unwrap_or_else(|_| "[]".to_string());
        let request = CompletionRequest::new(
            prompts::SUMMARY_SYSTEM_PROMPT,
            prompts::summary_user_text(question, query, &rows_json),
        )
        .with_max_tokens(300)
        .with_temperature(0.3);

        match tokio::time::timeout(self.timeout, provider.complete(&request)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!(provider = provider.name(), "Model summary produced");
                text.trim().to_string()
            }
            Ok(Ok(_)) => {
                warn!(provider = provider.name(), "Empty summary, using fallback");
                fallback_summary(rows)
            }
            Ok(Err(e)) => {
                warn!(provider = provider.name(), "Summary failed, using fallback: {}", e);
                fallback_summary(rows)
            }
            Err(_) => {
                warn!(
                    provider = provider.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Summary timed out, using fallback"
                );
                fallback_summary(rows)
            }
        }
    }
}

/// Deterministic summary of a result set
pub fn fallback_summary(rows: &[Row]) -> String {
    match rows {
        [] => "No results were found for your question.".to_string(),
        [row] if row.len() == 1 => {
            let (column, value) = row.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("value", &Value::Null));
            format!("The {} is {}.", column.replace('_', " "), display_value(value))
        }
        [row] if row.is_empty() => "Found 1 result.".to_string(),
        [row] => {
            let pairs: Vec<String> = row
                .iter()
                .map(|(k, v)| format!("{} = {}", k, display_value(v)))
                .collect();
            format!("Found 1 result: {}.", pairs.join(", "))
        }
        _ => {
            let columns: Vec<&str> = rows[0].keys().map(String::as_str).collect();
            format!("Found {} results with columns {}.", rows.len(), columns.join(", "))
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NlqError, Result};
    use async_trait::async_trait;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_fallback_shapes() {
        assert_eq!(fallback_summary(&[]), "No results were found for your question.");
        assert_eq!(fallback_summary(&[row(&[("count", json!(42))])]), "The count is 42.");
        assert_eq!(
            fallback_summary(&[row(&[("average_amount", json!("19.5"))])]),
            "The average amount is 19.5."
        );
        assert_eq!(
            fallback_summary(&[row(&[("a", json!(1)), ("b", json!("x"))])]),
            "Found 1 result: a = 1, b = x."
        );
        let many = vec![
            row(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]),
            row(&[("a", json!(4)), ("b", json!(5)), ("c", json!(6))]),
        ];
        assert_eq!(fallback_summary(&many), "Found 2 results with columns a, b, c.");
    }

    #[test]
    fn test_fallback_is_idempotent() {
        let rows = vec![row(&[("name", json!("Ada")), ("id", json!(7))])];
        assert_eq!(fallback_summary(&rows), fallback_summary(&rows));
    }

    struct Failing;

    #[async_trait]
    impl ModelProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            Err(NlqError::Provider("unavailable".to_string()))
        }
    }

    struct Echo;

    #[async_trait]
    impl ModelProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            assert!(request.user_text.contains("how many users?"));
            Ok(" There are 42 users. ".to_string())
        }
    }

    #[tokio::test]
    async fn test_provider_failure_uses_fallback() {
        let summarizer = ResultSummarizer::new(Arc::new(Failing), Duration::from_secs(1));
        let rows = vec![row(&[("count", json!(3))])];
        assert_eq!(summarizer.summarize("SELECT 1", &rows, "q").await, "The count is 3.");
    }

    #[tokio::test]
    async fn test_provider_summary_is_used() {
        let summarizer = ResultSummarizer::new(Arc::new(Echo), Duration::from_secs(1));
        let rows = vec![row(&[("count", json!(42))])];
        assert_eq!(
            summarizer.summarize("SELECT COUNT(*) FROM users", &rows, "how many users?").await,
            "There are 42 users."
        );
    }
}
