//! Read-Only Query Validation
//!
//! Every generated query passes through `QueryValidator::validate` before it
//! can reach the executor, whichever tier produced it. The executor only
//! accepts `ValidatedQuery`, which nothing else can construct.

use crate::schema::Dialect;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;

lazy_static! {
    static ref DOCUMENT_CALL: Regex =
        Regex::new(r"^db\.([A-Za-z_][\w.-]*)\.([A-Za-z]+)\s*\(").expect("valid document call pattern");
    static ref DOCUMENT_WRITE_STAGE: Regex =
        Regex::new(r#"["']?\$(out|merge)["']?\s*:"#).expect("valid write stage pattern");
    static ref METHOD_CALL: Regex = Regex::new(r"\.\s*([A-Za-z_$][\w$]*)\s*\(").expect("valid method call pattern");
    static ref FUNCTION_WORD: Regex = Regex::new(r"\bfunction\b").expect("valid function pattern");
}

/// Read-only document operations
const DOCUMENT_READ_VERBS: [&str; 6] = ["find", "findOne", "aggregate", "count", "countDocuments", "distinct"];

/// Cursor modifiers that may be chained after a read operation
const CURSOR_METHODS: [&str; 11] = [
    "sort",
    "limit",
    "skip",
    "project",
    "projection",
    "hint",
    "collation",
    "batchSize",
    "maxTimeMS",
    "toArray",
    "pretty",
];

/// Keywords that write, lock or change schema; not allowed anywhere in a read query
const MUTATING_KEYWORDS: [Keyword; 14] = [
    Keyword::INSERT,
    Keyword::UPDATE,
    Keyword::DELETE,
    Keyword::DROP,
    Keyword::ALTER,
    Keyword::CREATE,
    Keyword::TRUNCATE,
    Keyword::GRANT,
    Keyword::REVOKE,
    Keyword::INTO,
    Keyword::COPY,
    Keyword::MERGE,
    Keyword::CALL,
    Keyword::EXECUTE,
];

/// A query that passed the read-only predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedQuery {
    text: String,
    dialect: Dialect,
}

impl ValidatedQuery {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

impl fmt::Display for ValidatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

pub struct QueryValidator;

impl QueryValidator {
    pub fn validate(text: &str, dialect: Dialect) -> Result<ValidatedQuery, Rejection> {
        let trimmed = text.trim().trim_end_matches(';').trim_end();
        if trimmed.is_empty() {
            return Err(Rejection::new("Query is empty"));
        }

        match dialect {
            Dialect::Relational => Self::validate_sql(trimmed)?,
            Dialect::Document => Self::validate_document(trimmed)?,
        }

        Ok(ValidatedQuery {
            text: trimmed.to_string(),
            dialect,
        })
    }

    fn validate_sql(sql: &str) -> Result<(), Rejection> {
        let lower = sql.to_lowercase();
        let starts_with_select = lower.starts_with("select")
            && lower[6..].chars().next().map_or(true, |c| !c.is_alphanumeric() && c != '_');
        if !starts_with_select {
            return Err(Rejection::new("Only SELECT queries are allowed"));
        }

        let dialect = PostgreSqlDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize()
            .map_err(|e| Rejection::new(format!("Query could not be tokenized: {}", e)))?;

        let mut after_separator = false;
        for token in &tokens {
            match token {
                Token::SemiColon => after_separator = true,
                Token::Whitespace(_) => {}
                Token::Word(word) => {
                    if after_separator {
                        return Err(Rejection::new("Multiple statements are not allowed"));
                    }
                    if word.quote_style.is_none() && MUTATING_KEYWORDS.contains(&word.keyword) {
                        return Err(Rejection::new(format!(
                            "Query contains a forbidden keyword: {}",
                            word.value.to_uppercase()
                        )));
                    }
                }
                _ => {
                    if after_separator {
                        return Err(Rejection::new("Multiple statements are not allowed"));
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_document(expr: &str) -> Result<(), Rejection> {
        let captures = DOCUMENT_CALL
            .captures(expr)
            .ok_or_else(|| Rejection::new("Expected a db.<collection>.<method>(...) expression"))?;

        let verb = &captures[2];
        if !DOCUMENT_READ_VERBS.contains(&verb) {
            return Err(Rejection::new(format!("Only read operations are allowed, found '{}'", verb)));
        }

        let code = strip_literals(expr)?;

        if code.contains("=>") || FUNCTION_WORD.is_match(&code) {
            return Err(Rejection::new("Callbacks and function bodies are not allowed"));
        }

        // Every call in the chain, not just the leading one
        for call in METHOD_CALL.captures_iter(&code) {
            let method = &call[1];
            if !DOCUMENT_READ_VERBS.contains(&method) && !CURSOR_METHODS.contains(&method) {
                return Err(Rejection::new(format!("Only read operations are allowed, found '{}'", method)));
            }
        }

        if DOCUMENT_WRITE_STAGE.is_match(expr) {
            return Err(Rejection::new("Aggregation stages that write ($out, $merge) are not allowed"));
        }

        Ok(())
    }
}

/// Blank out string literal contents so only code is inspected. Fails on a
/// `;` anywhere in code, or a line break outside of any brackets, since
/// either one starts a second statement.
fn strip_literals(expr: &str) -> Result<String, Rejection> {
    let mut code = String::with_capacity(expr.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth: usize = 0;

    for c in expr.chars() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == open {
                quote = None;
                code.push(c);
                continue;
            }
            code.push(' ');
            continue;
        }

        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ';' => return Err(Rejection::new("Multiple statements are not allowed")),
            '\n' | '\r' if depth == 0 => return Err(Rejection::new("Multiple statements are not allowed")),
            _ => {}
        }
        code.push(c);
    }

    if quote.is_some() {
        return Err(Rejection::new("Unterminated string literal"));
    }
    Ok(code)
}
