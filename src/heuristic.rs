//! Keyword Query Generator
//!
//! The last tier of the fallback chain. Maps phrase patterns in the question
//! to canned query templates over the best-matching relation. Deterministic
//! and model-free; it only gives up when the schema has no relations at all.

use crate::ambiguity::BUCKETS;
use crate::schema::{Dialect, NameMapping, RelationDescriptor, SchemaDescriptor};
use chrono::{DateTime, Duration, Utc};

/// What the question asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionShape {
    Count,
    Top,
    Average,
    Recent,
    List,
}

const COUNT_WORDS: [&str; 2] = ["count", "counts"];
const AVERAGE_WORDS: [&str; 4] = ["average", "averages", "avg", "mean"];
const TOP_WORDS: [&str; 4] = ["top", "highest", "largest", "biggest"];
const RECENT_WORDS: [&str; 3] = ["recent", "latest", "newest"];

impl QuestionShape {
    pub fn of(message_lower: &str) -> Self {
        if has_word(message_lower, &COUNT_WORDS) || message_lower.contains("how many") || message_lower.contains("number of") {
            QuestionShape::Count
        } else if has_word(message_lower, &AVERAGE_WORDS) {
            QuestionShape::Average
        } else if has_word(message_lower, &TOP_WORDS) {
            QuestionShape::Top
        } else if has_word(message_lower, &RECENT_WORDS) {
            QuestionShape::Recent
        } else {
            QuestionShape::List
        }
    }
}

/// Whole-word match, so "country" is not "count"
fn has_word(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| words.contains(&word))
}

/// PostgreSQL reserved words that cannot appear as bare identifiers
const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "authorization", "binary",
    "both", "case", "cast", "check", "collate", "collation", "column", "concurrently", "constraint", "create",
    "cross", "current_catalog", "current_date", "current_role", "current_schema", "current_time",
    "current_timestamp", "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end", "except",
    "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group", "having", "ilike", "in",
    "initially", "inner", "intersect", "into", "is", "isnull", "join", "lateral", "leading", "left", "like",
    "limit", "localtime", "localtimestamp", "natural", "not", "notnull", "null", "offset", "on", "only", "or",
    "order", "outer", "overlaps", "placing", "primary", "references", "returning", "right", "select",
    "session_user", "similar", "some", "symmetric", "table", "tablesample", "then", "to", "trailing", "true",
    "union", "unique", "user", "using", "variadic", "verbose", "when", "where", "window", "with",
];

fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

/// Quote an identifier unless it is a plain lowercase name
pub fn quote_ident(name: &str) -> String {
    let plain = name.chars().next().map_or(false, |c| c.is_ascii_lowercase() || c == '_')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain && !is_reserved(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Lower bound in days implied by the question, if any
pub fn time_window_days(message_lower: &str) -> Option<i64> {
    if message_lower.contains("today") || message_lower.contains("yesterday") || message_lower.contains("24 hours") {
        Some(1)
    } else if message_lower.contains("week") {
        Some(7)
    } else if message_lower.contains("month") {
        Some(30)
    } else if message_lower.contains("year") {
        Some(365)
    } else {
        None
    }
}

pub struct KeywordQueryGenerator;

impl KeywordQueryGenerator {
    /// Produce a query for the question, or `None` for an empty schema
    pub fn generate(
        message: &str,
        schema: &SchemaDescriptor,
        mapping: &NameMapping,
        selections: &[String],
    ) -> Option<String> {
        Self::generate_at(message, schema, mapping, selections, Utc::now())
    }

    /// `generate` with an explicit clock (document time windows are absolute)
    pub fn generate_at(
        message: &str,
        schema: &SchemaDescriptor,
        mapping: &NameMapping,
        selections: &[String],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let lower = message.to_lowercase();
        let relation = Self::resolve_relation(&lower, schema, mapping, selections)?;
        let shape = QuestionShape::of(&lower);
        let window = time_window_days(&lower);

        Some(match schema.dialect {
            Dialect::Relational => Self::sql_template(relation, shape, window),
            Dialect::Document => Self::document_template(relation, shape, window, now),
        })
    }

    /// Pick the relation the question is about
    pub fn resolve_relation<'a>(
        message_lower: &str,
        schema: &'a SchemaDescriptor,
        mapping: &NameMapping,
        selections: &[String],
    ) -> Option<&'a RelationDescriptor> {
        // Clarification answers win; the last selection is the most specific.
        if let Some(r) = selections.iter().rev().find_map(|s| schema.relation(s)) {
            return Some(r);
        }

        if let Some(r) = mapping
            .iter()
            .filter(|(semantic, _)| message_lower.contains(&semantic.to_lowercase()))
            .find_map(|(_, actual)| schema.relation(actual))
        {
            return Some(r);
        }

        if let Some(r) = schema.relations.iter().find(|r| {
            let name = r.name.to_lowercase();
            message_lower.contains(&name)
                || message_lower.contains(&name.replace('_', " "))
                || name
                    .strip_suffix('s')
                    .map(|singular| singular.len() > 2 && message_lower.contains(singular))
                    .unwrap_or(false)
        }) {
            return Some(r);
        }

        if let Some(r) = BUCKETS
            .iter()
            .filter(|b| b.mentioned_in(message_lower))
            .find_map(|b| schema.relations.iter().find(|r| b.matches_relation(&r.name)))
        {
            return Some(r);
        }

        schema.relations.first()
    }

    fn sql_template(relation: &RelationDescriptor, shape: QuestionShape, window: Option<i64>) -> String {
        let table = quote_ident(&relation.name);
        let time_field = relation.time_field().map(|f| f.name.as_str());
        let measure = relation.measure_field().map(|f| f.name.as_str());

        let filter = match (window, time_field) {
            (Some(days), Some(col)) => format!(" WHERE {} >= NOW() - INTERVAL '{} days'", quote_ident(col), days),
            _ => String::new(),
        };

        match (shape, measure, time_field) {
            (QuestionShape::Count, _, _) => format!("SELECT COUNT(*) AS count FROM {}{}", table, filter),
            (QuestionShape::Average, Some(m), _) => format!(
                "SELECT AVG({}) AS {} FROM {}{}",
                quote_ident(m),
                quote_ident(&format!("average_{}", m)),
                table,
                filter
            ),
            (QuestionShape::Top, Some(m), _) => {
                format!("SELECT * FROM {}{} ORDER BY {} DESC LIMIT 5", table, filter, quote_ident(m))
            }
            (QuestionShape::Top, None, _) => format!("SELECT * FROM {}{} LIMIT 5", table, filter),
            (QuestionShape::Recent, _, Some(t)) => {
                format!("SELECT * FROM {}{} ORDER BY {} DESC LIMIT 10", table, filter, quote_ident(t))
            }
            _ => format!("SELECT * FROM {}{} LIMIT 10", table, filter),
        }
    }

    fn document_template(
        relation: &RelationDescriptor,
        shape: QuestionShape,
        window: Option<i64>,
        now: DateTime<Utc>,
    ) -> String {
        let collection = &relation.name;
        let time_field = relation.time_field().map(|f| f.name.as_str());
        let measure = relation.measure_field().map(|f| f.name.as_str());

        let filter = match (window, time_field) {
            (Some(days), Some(col)) => format!(
                "{{\"{}\": {{\"$gte\": {{\"$date\": \"{}\"}}}}}}",
                col,
                (now - Duration::days(days)).to_rfc3339()
            ),
            _ => "{}".to_string(),
        };

        match (shape, measure, time_field) {
            (QuestionShape::Count, _, _) => format!("db.{}.countDocuments({})", collection, filter),
            (QuestionShape::Average, Some(m), _) => format!(
                "db.{}.aggregate([{{\"$match\": {}}}, {{\"$group\": {{\"_id\": null, \"average_{m}\": {{\"$avg\": \"${m}\"}}}}}}])",
                collection,
                filter,
                m = m
            ),
            (QuestionShape::Top, Some(m), _) => {
                format!("db.{}.find({}).sort({{\"{}\": -1}}).limit(5)", collection, filter, m)
            }
            (QuestionShape::Top, None, _) => format!("db.{}.find({}).limit(5)", collection, filter),
            (QuestionShape::Recent, _, Some(t)) => {
                format!("db.{}.find({}).sort({{\"{}\": -1}}).limit(10)", collection, filter, t)
            }
            _ => format!("db.{}.find({}).limit(10)", collection, filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;

    fn schema(dialect: Dialect) -> SchemaDescriptor {
        SchemaDescriptor::new(
            dialect,
            vec![
                RelationDescriptor::new(
                    "users",
                    vec![
                        FieldDescriptor::new("id", "integer").primary_key(),
                        FieldDescriptor::new("name", "text"),
                        FieldDescriptor::new("created_at", "timestamp"),
                    ],
                ),
                RelationDescriptor::new(
                    "payments",
                    vec![
                        FieldDescriptor::new("id", "integer").primary_key(),
                        FieldDescriptor::new("user_id", "integer"),
                        FieldDescriptor::new("amount", "numeric"),
                        FieldDescriptor::new("created_at", "timestamp"),
                    ],
                ),
            ],
        )
    }

    fn sql(message: &str) -> String {
        KeywordQueryGenerator::generate(message, &schema(Dialect::Relational), &NameMapping::new(), &[]).unwrap()
    }

    #[test]
    fn test_count_last_week() {
        assert_eq!(
            sql("How many users signed up last week?"),
            "SELECT COUNT(*) AS count FROM users WHERE created_at >= NOW() - INTERVAL '7 days'"
        );
    }

    #[test]
    fn test_top_payments() {
        assert_eq!(
            sql("top paying payments"),
            "SELECT * FROM payments ORDER BY amount DESC LIMIT 5"
        );
    }

    #[test]
    fn test_average_and_recent() {
        assert_eq!(sql("average payment"), "SELECT AVG(amount) AS average_amount FROM payments");
        assert_eq!(
            sql("latest users"),
            "SELECT * FROM users ORDER BY created_at DESC LIMIT 10"
        );
    }

    #[test]
    fn test_default_relation_fallback() {
        assert_eq!(sql("what's going on?"), "SELECT * FROM users LIMIT 10");
    }

    #[test]
    fn test_selection_and_mapping_win() {
        let s = schema(Dialect::Relational);
        let mut mapping = NameMapping::new();
        mapping.insert("revenue".to_string(), "payments".to_string());
        assert_eq!(
            KeywordQueryGenerator::generate("count revenue rows", &s, &mapping, &[]).unwrap(),
            "SELECT COUNT(*) AS count FROM payments"
        );
        assert_eq!(
            KeywordQueryGenerator::generate("count users", &s, &NameMapping::new(), &["payments".to_string()]).unwrap(),
            "SELECT COUNT(*) AS count FROM payments"
        );
    }

    #[test]
    fn test_empty_schema_yields_nothing() {
        let empty = SchemaDescriptor::new(Dialect::Relational, vec![]);
        assert!(KeywordQueryGenerator::generate("count users", &empty, &NameMapping::new(), &[]).is_none());
    }

    #[test]
    fn test_document_templates() {
        let s = schema(Dialect::Document);
        let now = DateTime::parse_from_rfc3339("2026-01-08T00:00:00Z").unwrap().with_timezone(&Utc);
        let count = KeywordQueryGenerator::generate_at("how many users this week", &s, &NameMapping::new(), &[], now).unwrap();
        assert_eq!(
            count,
            "db.users.countDocuments({\"created_at\": {\"$gte\": {\"$date\": \"2026-01-01T00:00:00+00:00\"}}})"
        );

        let top = KeywordQueryGenerator::generate_at("highest payments", &s, &NameMapping::new(), &[], now).unwrap();
        assert_eq!(top, "db.payments.find({}).sort({\"amount\": -1}).limit(5)");
    }

    #[test]
    fn test_shape_matches_whole_words() {
        assert_eq!(QuestionShape::of("list users by country"), QuestionShape::List);
        assert_eq!(QuestionShape::of("payments per topic"), QuestionShape::List);
        assert_eq!(QuestionShape::of("the meaning of the counter column"), QuestionShape::List);
        assert_eq!(QuestionShape::of("signup counts per day"), QuestionShape::Count);
        assert_eq!(QuestionShape::of("avg spend"), QuestionShape::Average);
        assert_eq!(sql("list users by country"), "SELECT * FROM users LIMIT 10");
    }

    #[test]
    fn test_identifiers_are_quoted_when_needed() {
        let s = SchemaDescriptor::new(
            Dialect::Relational,
            vec![
                RelationDescriptor::new("User", vec![FieldDescriptor::new("id", "integer").primary_key()]),
                RelationDescriptor::new(
                    "order",
                    vec![
                        FieldDescriptor::new("id", "integer").primary_key(),
                        FieldDescriptor::new("Total", "numeric"),
                        FieldDescriptor::new("createdAt", "timestamp"),
                    ],
                ),
            ],
        );
        let generate = |message: &str| KeywordQueryGenerator::generate(message, &s, &NameMapping::new(), &[]).unwrap();

        assert_eq!(generate("list User"), "SELECT * FROM \"User\" LIMIT 10");
        assert_eq!(
            generate("how many order this week"),
            "SELECT COUNT(*) AS count FROM \"order\" WHERE \"createdAt\" >= NOW() - INTERVAL '7 days'"
        );
        assert_eq!(
            generate("average order"),
            "SELECT AVG(\"Total\") AS \"average_Total\" FROM \"order\""
        );
        assert_eq!(quote_ident("created_at"), "created_at");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
