//! Natural-language query engine
//!
//! Turns a question into a validated, read-only query, runs it and
//! summarizes the rows. See `pipeline::QueryPipeline::handle_turn`.

pub mod ambiguity;
pub mod audit;
pub mod clarification;
pub mod config;
pub mod db;
pub mod error;
pub mod error_classifier;
pub mod executor;
pub mod fallback;
pub mod generator;
pub mod heuristic;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod summarizer;
pub mod validation;

pub use ambiguity::{Ambiguity, AmbiguityDetector};
pub use audit::{AuditRecord, AuditSink, AuditSummary, FailureStage, InMemoryAuditSink, JsonlAuditSink};
pub use clarification::{
    ClarificationContext, ClarificationState, ClarificationStore, Conversation, MemoryClarificationStore,
};
pub use config::PipelineConfig;
pub use error::{NlqError, Result};
pub use error_classifier::{ErrorClass, ErrorClassifier};
pub use executor::{AdapterError, DatabaseAdapter, ExecutionLimits, ExecutionOutcome, QueryExecutor, Row};
pub use fallback::{FallbackChain, GenerationTier, KeywordTier, ModelTier};
pub use generator::{ClarificationAnswer, GenerationRequest, GenerationResult, QueryGenerator};
pub use llm::{CompletionRequest, LlmClient, ModelProvider};
pub use pipeline::{QueryPipeline, Turn, TurnResponse};
pub use schema::{
    ConnectionRef, Dialect, FieldDescriptor, NameMapping, RelationDescriptor, SchemaBundle, SchemaDescriptor,
    SchemaProvider, StaticSchemaProvider,
};
pub use summarizer::ResultSummarizer;
pub use validation::{QueryValidator, Rejection, ValidatedQuery};
