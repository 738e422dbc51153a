//! Query Generator
//!
//! Builds the prompt for a turn, runs the fallback chain and turns the raw
//! text of the first usable tier into a query or a clarification question.

use crate::ambiguity::AmbiguityDetector;
use crate::fallback::{FallbackChain, TierInput};
use crate::llm::CompletionRequest;
use crate::prompts::{self, CLARIFICATION_SENTINEL};
use crate::schema::{Dialect, NameMapping, SchemaDescriptor};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"```[A-Za-z]*[ \t]*\r?\n?([\s\S]*?)```").expect("valid code fence pattern");
}

/// Relation the user picked, plus any picked in earlier rounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub selected_relation: String,
    #[serde(default)]
    pub earlier_selections: Vec<String>,
}

impl ClarificationAnswer {
    pub fn new(selected_relation: impl Into<String>) -> Self {
        Self {
            selected_relation: selected_relation.into(),
            earlier_selections: Vec::new(),
        }
    }

    /// All selections, oldest first
    pub fn selections(&self) -> Vec<String> {
        let mut all = self.earlier_selections.clone();
        all.push(self.selected_relation.clone());
        all
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message: String,
    pub schema: SchemaDescriptor,
    pub mapping: NameMapping,
    pub dialect: Dialect,
    pub clarification_answer: Option<ClarificationAnswer>,
}

impl GenerationRequest {
    pub fn new(message: impl Into<String>, schema: SchemaDescriptor, mapping: NameMapping) -> Self {
        let dialect = schema.dialect;
        Self {
            message: message.into(),
            schema,
            mapping,
            dialect,
            clarification_answer: None,
        }
    }

    pub fn with_answer(mut self, answer: ClarificationAnswer) -> Self {
        self.clarification_answer = Some(answer);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationResult {
    Query { text: String, source: String },
    NeedsClarification { question: String, options: Vec<String> },
    Failed { reason: String },
}

/// Usable tier output before the source is attached
enum Normalized {
    Query(String),
    Clarify { question: String, options: Vec<String> },
}

pub struct QueryGenerator {
    chain: FallbackChain,
}

impl QueryGenerator {
    pub fn new(chain: FallbackChain) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    pub async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let selections = request
            .clarification_answer
            .as_ref()
            .map(ClarificationAnswer::selections)
            .unwrap_or_default();

        let system_prompt = prompts::generation_system_prompt(&request.schema, &request.mapping, request.dialect);
        let user_text = prompts::generation_user_text(&request.message, &selections, request.dialect);

        let input = TierInput {
            completion: CompletionRequest::new(system_prompt, user_text),
            message: &request.message,
            schema: &request.schema,
            mapping: &request.mapping,
            selections: &selections,
        };

        let clarifying = request.clarification_answer.is_some();
        let accept = |raw: &str| normalize(raw, request, clarifying);

        match self.chain.invoke(&input, accept).await {
            Ok(output) => match output.value {
                Normalized::Query(text) => {
                    info!(source = %output.tier, "Generated query: {}", text);
                    GenerationResult::Query {
                        text,
                        source: output.tier,
                    }
                }
                Normalized::Clarify { question, options } => {
                    info!(source = %output.tier, "Model asked for clarification");
                    GenerationResult::NeedsClarification { question, options }
                }
            },
            Err(e) => {
                warn!("All generation tiers exhausted: {}", e);
                GenerationResult::Failed { reason: e.to_string() }
            }
        }
    }
}

/// Remove Markdown code fences, keeping the fenced body
pub fn strip_code_fences(raw: &str) -> String {
    match CODE_FENCE.captures(raw) {
        Some(captures) => captures[1].trim().to_string(),
        None => raw.trim().trim_start_matches("```").trim_end_matches("```").trim().to_string(),
    }
}

fn normalize(raw: &str, request: &GenerationRequest, clarifying: bool) -> Option<Normalized> {
    let text = strip_code_fences(raw);

    if let Some(pos) = text.find(CLARIFICATION_SENTINEL) {
        // The user already answered; asking again would loop.
        if clarifying {
            return None;
        }
        return clarification_from(&text[pos + CLARIFICATION_SENTINEL.len()..], request);
    }

    let lower = text.to_lowercase();
    if lower.is_empty() || lower.contains("sorry") || lower.contains("cannot") {
        return None;
    }

    let well_formed = match request.dialect {
        Dialect::Relational => lower.starts_with("select"),
        Dialect::Document => lower.starts_with("db."),
    };
    if !well_formed {
        return None;
    }

    Some(Normalized::Query(text.trim_end_matches(';').trim_end().to_string()))
}

fn clarification_from(rest: &str, request: &GenerationRequest) -> Option<Normalized> {
    let question = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace()).trim();
    let question = if question.is_empty() {
        format!("Which {} should I use?", request.dialect.relation_noun())
    } else {
        question.to_string()
    };

    let mut options = AmbiguityDetector::options_for(&question, &request.schema);
    if options.is_empty() {
        options = AmbiguityDetector::options_for(&request.message, &request.schema);
    }
    if options.is_empty() {
        options = request.schema.relation_names();
    }
    if options.is_empty() {
        return None;
    }

    Some(Normalized::Clarify { question, options })
}
