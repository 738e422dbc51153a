//! Model Fallback Chain
//!
//! Tiers are evaluated strictly in order by a single loop. A tier that times
//! out, errors, returns an empty body, or returns text the caller cannot use
//! is exhausted and the next tier runs. The keyword tier always comes last.

use crate::error::{NlqError, Result};
use crate::heuristic::KeywordQueryGenerator;
use crate::llm::{CompletionRequest, ModelProvider};
use crate::schema::{NameMapping, SchemaDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a tier may need to produce query text
pub struct TierInput<'a> {
    pub completion: CompletionRequest,
    pub message: &'a str,
    pub schema: &'a SchemaDescriptor,
    pub mapping: &'a NameMapping,
    pub selections: &'a [String],
}

#[async_trait]
pub trait GenerationTier: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(&self, input: &TierInput<'_>) -> Result<String>;
}

/// A model provider with its own timeout
pub struct ModelTier {
    provider: Arc<dyn ModelProvider>,
    timeout: Duration,
}

impl ModelTier {
    pub fn new(provider: Arc<dyn ModelProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }
}

#[async_trait]
impl GenerationTier for ModelTier {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn produce(&self, input: &TierInput<'_>) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.provider.complete(&input.completion)).await {
            Ok(result) => result,
            Err(_) => Err(NlqError::ProviderTimeout {
                provider: self.provider.name().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Deterministic keyword templates; fails only on an empty schema
pub struct KeywordTier;

pub const KEYWORD_TIER_NAME: &str = "keyword";

#[async_trait]
impl GenerationTier for KeywordTier {
    fn name(&self) -> &str {
        KEYWORD_TIER_NAME
    }

    async fn produce(&self, input: &TierInput<'_>) -> Result<String> {
        KeywordQueryGenerator::generate(input.message, input.schema, input.mapping, input.selections)
            .ok_or_else(|| NlqError::GenerationFailed("Schema has no relations to query".to_string()))
    }
}

/// Accepted value plus the tier that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput<T> {
    pub value: T,
    pub tier: String,
}

pub struct FallbackChain {
    tiers: Vec<Box<dyn GenerationTier>>,
}

impl FallbackChain {
    /// Model tiers in priority order; the keyword tier is appended
    pub fn new(model_tiers: Vec<Box<dyn GenerationTier>>) -> Self {
        let mut tiers = model_tiers;
        tiers.push(Box::new(KeywordTier));
        Self { tiers }
    }

    /// Chain with only the keyword tier
    pub fn keyword_only() -> Self {
        Self::new(Vec::new())
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Run tiers in order until `accept` takes one's output
    pub async fn invoke<T, F>(&self, input: &TierInput<'_>, accept: F) -> Result<ChainOutput<T>>
    where
        F: Fn(&str) -> Option<T> + Send + Sync,
    {
        let mut failures = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            debug!(tier = tier.name(), "Invoking generation tier");
            match tier.produce(input).await {
                Ok(text) if text.trim().is_empty() => {
                    warn!(tier = tier.name(), "Tier returned an empty response");
                    failures.push(format!("{}: empty response", tier.name()));
                }
                Ok(text) => match accept(&text) {
                    Some(value) => {
                        info!(tier = tier.name(), "✅ Generation tier produced a usable response");
                        return Ok(ChainOutput {
                            value,
                            tier: tier.name().to_string(),
                        });
                    }
                    None => {
                        warn!(tier = tier.name(), "Tier response was unusable");
                        failures.push(format!("{}: unusable response", tier.name()));
                    }
                },
                Err(e) => {
                    warn!(tier = tier.name(), "Tier failed: {}", e);
                    failures.push(format!("{}: {}", tier.name(), e));
                }
            }
        }

        Err(NlqError::GenerationFailed(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Dialect, FieldDescriptor, RelationDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Fail,
        Hang,
        Empty,
        Reply(&'static str),
    }

    struct FakeProvider {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self { name, behaviour, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl ModelProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Fail => Err(NlqError::Provider("503 Service Unavailable".to_string())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("SELECT 1".to_string())
                }
                Behaviour::Empty => Ok("   ".to_string()),
                Behaviour::Reply(text) => Ok(text.to_string()),
            }
        }
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            Dialect::Relational,
            vec![RelationDescriptor::new(
                "users",
                vec![FieldDescriptor::new("id", "integer").primary_key()],
            )],
        )
    }

    fn tier(provider: Arc<FakeProvider>) -> Box<dyn GenerationTier> {
        Box::new(ModelTier::new(provider, Duration::from_millis(50)))
    }

    fn accept_select(text: &str) -> Option<String> {
        text.trim().to_uppercase().starts_with("SELECT").then(|| text.trim().to_string())
    }

    #[tokio::test]
    async fn test_primary_wins() {
        let primary = FakeProvider::new("primary", Behaviour::Reply("SELECT id FROM users"));
        let secondary = FakeProvider::new("secondary", Behaviour::Reply("SELECT 2"));
        let chain = FallbackChain::new(vec![tier(primary.clone()), tier(secondary.clone())]);
        let s = schema();
        let mapping = NameMapping::new();
        let input = TierInput {
            completion: CompletionRequest::new("sys", "users"),
            message: "users",
            schema: &s,
            mapping: &mapping,
            selections: &[],
        };

        let output = chain.invoke(&input, accept_select).await.unwrap();
        assert_eq!(output.value, "SELECT id FROM users");
        assert_eq!(output.tier, "primary");
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_through_to_keyword_tier() {
        let primary = FakeProvider::new("primary", Behaviour::Hang);
        let secondary = FakeProvider::new("secondary", Behaviour::Fail);
        let chain = FallbackChain::new(vec![tier(primary.clone()), tier(secondary.clone())]);
        assert_eq!(chain.tier_names(), vec!["primary", "secondary", "keyword"]);

        let s = schema();
        let mapping = NameMapping::new();
        let input = TierInput {
            completion: CompletionRequest::new("sys", "how many users"),
            message: "how many users",
            schema: &s,
            mapping: &mapping,
            selections: &[],
        };

        let output = chain.invoke(&input, accept_select).await.unwrap();
        assert_eq!(output.tier, KEYWORD_TIER_NAME);
        assert_eq!(output.value, "SELECT COUNT(*) AS count FROM users");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_and_unusable_responses_are_exhausted() {
        let primary = FakeProvider::new("primary", Behaviour::Empty);
        let secondary = FakeProvider::new("secondary", Behaviour::Reply("Sorry, I cannot help with that."));
        let chain = FallbackChain::new(vec![tier(primary), tier(secondary)]);
        let s = schema();
        let mapping = NameMapping::new();
        let input = TierInput {
            completion: CompletionRequest::new("sys", "users"),
            message: "users",
            schema: &s,
            mapping: &mapping,
            selections: &[],
        };

        let output = chain.invoke(&input, accept_select).await.unwrap();
        assert_eq!(output.tier, KEYWORD_TIER_NAME);
    }

    #[tokio::test]
    async fn test_every_tier_exhausted() {
        let chain = FallbackChain::keyword_only();
        let empty = SchemaDescriptor::new(Dialect::Relational, vec![]);
        let mapping = NameMapping::new();
        let input = TierInput {
            completion: CompletionRequest::new("sys", "users"),
            message: "users",
            schema: &empty,
            mapping: &mapping,
            selections: &[],
        };

        let err = chain.invoke(&input, accept_select).await.unwrap_err();
        assert!(matches!(err, NlqError::GenerationFailed(_)));
        assert!(err.to_string().contains("keyword"));
    }
}
