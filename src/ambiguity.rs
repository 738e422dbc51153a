//! Ambiguity Detection
//!
//! Runs before any model call. When a message mentions a semantic category
//! ("user", "order", "product") and the schema has more than one relation in
//! that category, the turn is short-circuited into a clarification question
//! instead of letting a model silently pick the wrong table.

use crate::schema::{Dialect, SchemaDescriptor};
use serde::{Deserialize, Serialize};

/// A semantic category of relation names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordBucket {
    pub label: &'static str,
    pub keywords: &'static [&'static str],
}

/// Buckets in priority order; the first ambiguous one wins.
pub const BUCKETS: [KeywordBucket; 3] = [
    KeywordBucket {
        label: "user",
        keywords: &["user", "customer", "client"],
    },
    KeywordBucket {
        label: "order",
        keywords: &["order", "purchase", "transaction"],
    },
    KeywordBucket {
        label: "product",
        keywords: &["product", "item", "goods"],
    },
];

impl KeywordBucket {
    pub fn mentioned_in(&self, text_lower: &str) -> bool {
        self.keywords.iter().any(|k| text_lower.contains(k))
    }

    pub fn matches_relation(&self, relation_name: &str) -> bool {
        let name = relation_name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k))
    }

    /// Relation names in this bucket, in schema order
    pub fn matching_relations(&self, schema: &SchemaDescriptor) -> Vec<String> {
        schema
            .relations
            .iter()
            .filter(|r| self.matches_relation(&r.name))
            .map(|r| r.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub ambiguous: bool,
    pub question: Option<String>,
    pub options: Option<Vec<String>>,
}

impl Ambiguity {
    pub fn none() -> Self {
        Self {
            ambiguous: false,
            question: None,
            options: None,
        }
    }
}

pub struct AmbiguityDetector;

impl AmbiguityDetector {
    /// Check a message against the schema
    pub fn detect(message: &str, schema: &SchemaDescriptor) -> Ambiguity {
        Self::detect_excluding(message, schema, &[])
    }

    /// Like `detect`, but skips buckets that an earlier clarification already
    /// resolved (any bucket whose matches include one of `resolved`).
    pub fn detect_excluding(message: &str, schema: &SchemaDescriptor, resolved: &[String]) -> Ambiguity {
        let lower = message.to_lowercase();

        for bucket in BUCKETS.iter() {
            if !bucket.mentioned_in(&lower) {
                continue;
            }

            let matches = bucket.matching_relations(schema);
            if matches.len() <= 1 {
                continue;
            }

            if matches
                .iter()
                .any(|m| resolved.iter().any(|r| r.eq_ignore_ascii_case(m)))
            {
                continue;
            }

            return Ambiguity {
                ambiguous: true,
                question: Some(Self::build_question(bucket, &matches, schema.dialect)),
                options: Some(matches),
            };
        }

        Ambiguity::none()
    }

    /// Relations of the first bucket mentioned in `text`, used to attach
    /// options to a model-raised clarification question.
    pub fn options_for(text: &str, schema: &SchemaDescriptor) -> Vec<String> {
        let lower = text.to_lowercase();
        BUCKETS
            .iter()
            .filter(|b| b.mentioned_in(&lower))
            .map(|b| b.matching_relations(schema))
            .find(|m| !m.is_empty())
            .unwrap_or_default()
    }

    fn build_question(bucket: &KeywordBucket, matches: &[String], dialect: Dialect) -> String {
        let noun = dialect.relation_noun();
        format!(
            "I found multiple {}-related {}s: {}. Which {} contains the {} data you're looking for?",
            bucket.label,
            noun,
            matches.join(", "),
            noun,
            bucket.label
        )
    }
}
