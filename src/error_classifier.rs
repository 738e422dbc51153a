//! Error Classifier
//!
//! Classifies pipeline failures into a closed taxonomy so callers can offer
//! guided recovery (schema browser, re-asking) instead of a raw message.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    AmbiguousRelation,
    GenerationFailed,
    UnsafeQuery,
    RelationNotFound,
    FieldNotFound,
    IncompleteQuery,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::AmbiguousRelation => "AMBIGUOUS_RELATION",
            ErrorClass::GenerationFailed => "GENERATION_FAILED",
            ErrorClass::UnsafeQuery => "UNSAFE_QUERY",
            ErrorClass::RelationNotFound => "RELATION_NOT_FOUND",
            ErrorClass::FieldNotFound => "FIELD_NOT_FOUND",
            ErrorClass::IncompleteQuery => "INCOMPLETE_QUERY",
            ErrorClass::Unknown => "UNKNOWN",
        }
    }

    /// What the user should be told to do next
    pub fn recommended_action(&self) -> &'static str {
        match self {
            ErrorClass::AmbiguousRelation => "Pick one of the suggested tables to continue.",
            ErrorClass::GenerationFailed => "I couldn't turn that question into a query. Please try again later.",
            ErrorClass::UnsafeQuery => "Only read-only queries can be run. Try rephrasing your question as a lookup.",
            ErrorClass::RelationNotFound => "That table doesn't exist. Check the Schema view for the available tables.",
            ErrorClass::FieldNotFound => "That column doesn't exist. Check the Schema view for the available columns.",
            ErrorClass::IncompleteQuery => "The generated query was incomplete. Try asking again, more specifically.",
            ErrorClass::Unknown => "The query failed. See the error message for details.",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of one raw adapter error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classified {
    pub class: ErrorClass,
    /// Missing relation/field name, or the token near a syntax error
    pub detail: Option<String>,
}

lazy_static! {
    static ref RELATION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"(?i)relation "([^"]+)" does not exist"#).expect("valid pattern"),
        Regex::new(r#"(?i)table "([^"]+)" does not exist"#).expect("valid pattern"),
        Regex::new(r"(?i)no such table:\s*([\w.]+)").expect("valid pattern"),
        Regex::new(r"(?i)collection '?([\w.-]+)'? (?:does not exist|not found)").expect("valid pattern"),
    ];
    static ref FIELD_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"(?i)column "([^"]+)" does not exist"#).expect("valid pattern"),
        Regex::new(r"(?i)column ([\w.]+) does not exist").expect("valid pattern"),
        Regex::new(r"(?i)no such column:\s*([\w.]+)").expect("valid pattern"),
    ];
    static ref INCOMPLETE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"(?i)missing FROM-clause entry for table "([^"]+)""#).expect("valid pattern"),
        Regex::new(r"(?i)syntax error at end of input()").expect("valid pattern"),
        Regex::new(r#"(?i)syntax error at or near "([^"]*)""#).expect("valid pattern"),
        Regex::new(r"(?i)unterminated quoted (?:string|identifier)()").expect("valid pattern"),
    ];
    static ref NAMESPACE_MISSING: Regex = Regex::new(r"(?i)\bns (?:does not exist|not found)").expect("valid pattern");
}

/// Error classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw adapter error message
    pub fn classify(&self, message: &str) -> Classified {
        let groups = [
            (ErrorClass::RelationNotFound, &*RELATION_PATTERNS),
            (ErrorClass::FieldNotFound, &*FIELD_PATTERNS),
            (ErrorClass::IncompleteQuery, &*INCOMPLETE_PATTERNS),
        ];

        for (class, patterns) in groups {
            for pattern in patterns.iter() {
                if let Some(captures) = pattern.captures(message) {
                    let detail = captures
                        .get(1)
                        .map(|m| m.as_str().to_string())
                        .filter(|s| !s.is_empty());
                    return Classified { class, detail };
                }
            }
        }

        if NAMESPACE_MISSING.is_match(message) {
            return Classified {
                class: ErrorClass::RelationNotFound,
                detail: None,
            };
        }

        Classified {
            class: ErrorClass::Unknown,
            detail: None,
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
