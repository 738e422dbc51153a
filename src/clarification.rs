//! Clarification State Machine
//!
//! A conversation is either idle or waiting for the user to pick one of the
//! options from a clarification question. The pending context lives in a
//! `ClarificationStore` keyed by conversation id; at most one per conversation.

use crate::error::{NlqError, Result};
use crate::generator::ClarificationAnswer;
use crate::pipeline::{QueryPipeline, Turn, TurnResponse};
use crate::schema::ConnectionRef;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, info};

/// Minimum Jaro-Winkler similarity for a fuzzy option match
const FUZZY_SELECTION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationContext {
    pub original_message: String,
    pub question: String,
    pub options: Vec<String>,
    /// Selections made in earlier rounds of a nested clarification
    #[serde(default)]
    pub resolved: Vec<String>,
}

impl ClarificationContext {
    /// Match user input against the options: exact name (case-insensitive),
    /// 1-based index, or a unique close fuzzy match.
    pub fn resolve_selection(&self, input: &str) -> Result<String> {
        let input = input.trim();

        if let Some(exact) = self.options.iter().find(|o| o.eq_ignore_ascii_case(input)) {
            return Ok(exact.clone());
        }

        if let Ok(index) = input.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| self.options.get(i))
                .cloned()
                .ok_or_else(|| NlqError::InvalidSelection {
                    selection: input.to_string(),
                    options: self.options.clone(),
                });
        }

        let lower = input.to_lowercase();
        let close: Vec<&String> = self
            .options
            .iter()
            .filter(|o| jaro_winkler(&o.to_lowercase(), &lower) >= FUZZY_SELECTION_THRESHOLD)
            .collect();
        if let [only] = close.as_slice() {
            return Ok((*only).clone());
        }

        Err(NlqError::ClarificationPending {
            question: self.question.clone(),
            options: self.options.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationState {
    Idle,
    AwaitingClarification(ClarificationContext),
}

/// Caller-supplied storage for pending contexts
pub trait ClarificationStore: Send + Sync {
    fn get(&self, conversation_id: &str) -> Option<ClarificationContext>;

    /// Store a context, replacing any existing one
    fn put(&self, conversation_id: &str, context: ClarificationContext);

    /// Remove and return the context; only one caller can win
    fn take(&self, conversation_id: &str) -> Option<ClarificationContext>;
}

#[derive(Debug, Default)]
pub struct MemoryClarificationStore {
    contexts: DashMap<String, ClarificationContext>,
}

impl MemoryClarificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl ClarificationStore for MemoryClarificationStore {
    fn get(&self, conversation_id: &str) -> Option<ClarificationContext> {
        self.contexts.get(conversation_id).map(|c| c.value().clone())
    }

    fn put(&self, conversation_id: &str, context: ClarificationContext) {
        self.contexts.insert(conversation_id.to_string(), context);
    }

    fn take(&self, conversation_id: &str) -> Option<ClarificationContext> {
        self.contexts.remove(conversation_id).map(|(_, c)| c)
    }
}

/// Drives turns for conversations on one connection and channel
pub struct Conversation {
    pipeline: Arc<QueryPipeline>,
    store: Arc<dyn ClarificationStore>,
    connection: ConnectionRef,
    channel: String,
}

impl Conversation {
    pub fn new(pipeline: Arc<QueryPipeline>, store: Arc<dyn ClarificationStore>, connection: ConnectionRef) -> Self {
        Self {
            pipeline,
            store,
            connection,
            channel: "api".to_string(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn state(&self, conversation_id: &str) -> ClarificationState {
        match self.store.get(conversation_id) {
            Some(context) => ClarificationState::AwaitingClarification(context),
            None => ClarificationState::Idle,
        }
    }

    /// Abandon a pending clarification so the next input starts a new turn
    pub fn reset(&self, conversation_id: &str) -> Option<ClarificationContext> {
        let abandoned = self.store.take(conversation_id);
        if abandoned.is_some() {
            info!(conversation = conversation_id, "Pending clarification abandoned");
        }
        abandoned
    }

    /// Submit user input for a conversation.
    ///
    /// While a clarification is pending, input must select one of its
    /// options; anything else is rejected and the context is kept.
    pub async fn submit(&self, conversation_id: &str, input: &str) -> Result<TurnResponse> {
        let turn = match self.store.get(conversation_id) {
            None => Turn::new(input, self.connection.clone()),
            Some(pending) => {
                let selected = pending.resolve_selection(input)?;
                let context = self.store.take(conversation_id).ok_or_else(|| NlqError::InvalidSelection {
                    selection: input.to_string(),
                    options: pending.options.clone(),
                })?;
                debug!(conversation = conversation_id, selected = %selected, "Clarification resolved");
                Turn::new(context.original_message, self.connection.clone()).with_clarification(ClarificationAnswer {
                    selected_relation: selected,
                    earlier_selections: context.resolved,
                })
            }
        };

        let turn = turn.with_actor(conversation_id).with_channel(&self.channel);
        let resolved = turn
            .prior_clarification
            .as_ref()
            .map(ClarificationAnswer::selections)
            .unwrap_or_default();
        let original_message = turn.message.clone();

        let response = self.pipeline.handle_turn(turn).await?;

        if let TurnResponse::Clarify { question, options } = &response {
            self.store.put(
                conversation_id,
                ClarificationContext {
                    original_message,
                    question: question.clone(),
                    options: options.clone(),
                    resolved,
                },
            );
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ClarificationContext {
        ClarificationContext {
            original_message: "show me orders".to_string(),
            question: "Which table?".to_string(),
            options: vec!["orders".to_string(), "order_summary".to_string()],
            resolved: vec![],
        }
    }

    #[test]
    fn test_resolve_by_name_and_index() {
        let ctx = context();
        assert_eq!(ctx.resolve_selection("ORDERS").unwrap(), "orders");
        assert_eq!(ctx.resolve_selection(" 2 ").unwrap(), "order_summary");
    }

    #[test]
    fn test_resolve_fuzzy_unique() {
        let ctx = context();
        assert_eq!(ctx.resolve_selection("order summary").unwrap(), "order_summary");
    }

    #[test]
    fn test_free_form_input_keeps_pending() {
        let ctx = context();
        match ctx.resolve_selection("actually, how many users are there?") {
            Err(NlqError::ClarificationPending { options, .. }) => assert_eq!(options.len(), 2),
            other => panic!("expected pending clarification, got {:?}", other),
        }
        assert!(matches!(ctx.resolve_selection("3"), Err(NlqError::InvalidSelection { .. })));
        assert!(matches!(ctx.resolve_selection("0"), Err(NlqError::InvalidSelection { .. })));
    }

    #[test]
    fn test_memory_store_take_once() {
        let store = MemoryClarificationStore::new();
        store.put("c1", context());
        assert_eq!(store.get("c1"), Some(context()));
        assert!(store.take("c1").is_some());
        assert!(store.take("c1").is_none());
        assert!(store.is_empty());
    }
}
