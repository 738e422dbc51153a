//! Query Pipeline
//!
//! `handle_turn` wires the stages together:
//! ambiguity check → generation → validation → execution → summary → audit.
//! Collaborators are shared immutably, so one pipeline serves any number of
//! concurrent turns.

use crate::ambiguity::AmbiguityDetector;
use crate::audit::{AuditRecord, AuditSink, FailureStage};
use crate::error::{NlqError, Result};
use crate::error_classifier::ErrorClass;
use crate::executor::{ExecutionOutcome, QueryExecutor, Row};
use crate::generator::{ClarificationAnswer, GenerationRequest, GenerationResult, QueryGenerator};
use crate::schema::{ConnectionRef, SchemaProvider};
use crate::summarizer::ResultSummarizer;
use crate::validation::QueryValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// One user turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub message: String,
    pub connection: ConnectionRef,
    pub actor: String,
    pub channel: String,
    pub prior_clarification: Option<ClarificationAnswer>,
}

impl Turn {
    pub fn new(message: impl Into<String>, connection: ConnectionRef) -> Self {
        Self {
            message: message.into(),
            connection,
            actor: "anonymous".to_string(),
            channel: "api".to_string(),
            prior_clarification: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_clarification(mut self, answer: ClarificationAnswer) -> Self {
        self.prior_clarification = Some(answer);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnResponse {
    Clarify {
        question: String,
        options: Vec<String>,
    },
    Answer {
        summary: String,
        query: String,
        rows: Vec<Row>,
    },
    Error {
        classification: ErrorClass,
        message: String,
        detail: Option<String>,
    },
}

pub struct QueryPipeline {
    schema_provider: Arc<dyn SchemaProvider>,
    generator: Arc<QueryGenerator>,
    executor: Arc<QueryExecutor>,
    summarizer: Arc<ResultSummarizer>,
    audit: Arc<dyn AuditSink>,
}

impl QueryPipeline {
    pub fn new(
        schema_provider: Arc<dyn SchemaProvider>,
        generator: Arc<QueryGenerator>,
        executor: Arc<QueryExecutor>,
        summarizer: Arc<ResultSummarizer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            schema_provider,
            generator,
            executor,
            summarizer,
            audit,
        }
    }

    /// Run one turn.
    ///
    /// Taxonomy failures come back as `TurnResponse::Error`; `Err` is only
    /// returned when a collaborator outside the taxonomy (schema provider)
    /// fails or the schema does not match the connection.
    pub async fn handle_turn(&self, turn: Turn) -> Result<TurnResponse> {
        let start = Instant::now();
        info!(
            actor = %turn.actor,
            channel = %turn.channel,
            connection = %turn.connection,
            "Handling turn: {}",
            turn.message
        );

        let bundle = self.schema_provider.get_schema(&turn.connection).await?;
        if bundle.schema.dialect != turn.connection.dialect {
            return Err(NlqError::Schema(format!(
                "Connection {} expects a {} schema but the provider returned {}",
                turn.connection, turn.connection.dialect, bundle.schema.dialect
            )));
        }

        let resolved = turn
            .prior_clarification
            .as_ref()
            .map(ClarificationAnswer::selections)
            .unwrap_or_default();

        let ambiguity = AmbiguityDetector::detect_excluding(&turn.message, &bundle.schema, &resolved);
        if ambiguity.ambiguous {
            info!("Ambiguous relation reference, asking for clarification");
            return Ok(TurnResponse::Clarify {
                question: ambiguity.question.unwrap_or_default(),
                options: ambiguity.options.unwrap_or_default(),
            });
        }

        let mut request = GenerationRequest::new(turn.message.clone(), bundle.schema, bundle.mapping);
        if let Some(answer) = turn.prior_clarification.clone() {
            request = request.with_answer(answer);
        }

        let record = AuditRecord::new(&turn.actor, &turn.channel, &turn.message);

        let (text, source) = match self.generator.generate(&request).await {
            GenerationResult::Query { text, source } => (text, source),
            GenerationResult::NeedsClarification { question, options } => {
                return Ok(TurnResponse::Clarify { question, options });
            }
            GenerationResult::Failed { reason } => {
                let record = record.with_error(FailureStage::Generation, ErrorClass::GenerationFailed, &reason);
                return Ok(self
                    .finish(record, start, error_response(ErrorClass::GenerationFailed, reason, None))
                    .await);
            }
        };
        let record = record.with_query(&text);

        let validated = match QueryValidator::validate(&text, turn.connection.dialect) {
            Ok(validated) => validated,
            Err(rejection) => {
                warn!(source = %source, "Rejected generated query: {}", rejection);
                let record = record.with_error(FailureStage::Validation, ErrorClass::UnsafeQuery, &rejection.reason);
                return Ok(self
                    .finish(record, start, error_response(ErrorClass::UnsafeQuery, rejection.reason, None))
                    .await);
            }
        };

        match self.executor.execute(&turn.connection, &validated).await {
            ExecutionOutcome::Success { rows, truncated } => {
                if truncated {
                    info!(max_rows = self.executor.limits().max_rows, "Result truncated to row cap");
                }
                let summary = self.summarizer.summarize(validated.text(), &rows, &turn.message).await;
                let record = record.with_rows(rows.clone());
                let response = TurnResponse::Answer {
                    summary,
                    query: validated.text().to_string(),
                    rows,
                };
                Ok(self.finish(record, start, response).await)
            }
            ExecutionOutcome::Error {
                classification,
                message,
                detail,
            } => {
                let record = record.with_error(FailureStage::Execution, classification, &message);
                Ok(self
                    .finish(record, start, error_response(classification, message, detail))
                    .await)
            }
        }
    }

    /// Append the audit record as the last step of a terminal turn
    async fn finish(&self, record: AuditRecord, start: Instant, response: TurnResponse) -> TurnResponse {
        let record = record.with_execution_time(start.elapsed().as_millis() as u64);
        let id = record.id;
        if let Err(e) = self.audit.append(record).await {
            error!(audit_id = %id, "Failed to append audit record: {}", e);
        }
        response
    }
}

fn error_response(classification: ErrorClass, message: String, detail: Option<String>) -> TurnResponse {
    TurnResponse::Error {
        classification,
        message,
        detail,
    }
}
