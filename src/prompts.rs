//! Prompt Construction
//!
//! Deterministic system prompts for query generation and summarization.
//! The same schema, mapping and dialect always produce the same prompt text.

use crate::schema::{Dialect, NameMapping, SchemaDescriptor};

/// Marker a model emits instead of guessing
pub const CLARIFICATION_SENTINEL: &str = "CLARIFICATION_NEEDED";

/// Build the system prompt for query generation
pub fn generation_system_prompt(schema: &SchemaDescriptor, mapping: &NameMapping, dialect: Dialect) -> String {
    let mut prompt = format!(
        "You are a database query assistant. Your job is to convert natural language questions into {} queries.\n\n\
         CRITICAL: Before generating any query, analyze the schema carefully and understand the relationships between {}s.\n\n\
         Database Schema:\n",
        dialect.language(),
        dialect.relation_noun()
    );

    for relation in &schema.relations {
        match dialect {
            Dialect::Relational => {
                prompt.push_str(&format!("\nTable: {}\n", relation.name));
                for field in &relation.fields {
                    prompt.push_str(&format!(
                        "  - {} ({}){}\n",
                        field.name,
                        field.field_type,
                        if field.is_primary_key { " [PRIMARY KEY]" } else { "" }
                    ));
                }
            }
            Dialect::Document => {
                prompt.push_str(&format!("\nCollection: {}\n", relation.name));
                for field in &relation.fields {
                    prompt.push_str(&format!("  - {} ({})\n", field.name, field.field_type));
                }
            }
        }
    }

    if !mapping.is_empty() {
        prompt.push_str(&format!("\n{} Mappings:\n", capitalize(dialect.relation_noun())));
        for (semantic, actual) in mapping {
            prompt.push_str(&format!("  - {} -> {}\n", semantic, actual));
        }
    }

    prompt.push_str(&instructions(dialect));
    prompt
}

fn instructions(dialect: Dialect) -> String {
    let (complete, limit, examples) = match dialect {
        Dialect::Relational => (
            "Generate COMPLETE SQL queries including FROM, JOIN, WHERE, GROUP BY, ORDER BY clauses as needed. \
             Do NOT truncate or abbreviate the query",
            "Always include a LIMIT clause to prevent large result sets",
            "- SELECT u.first_name, u.last_name, COUNT(o.id) AS order_count FROM orders o JOIN users u ON o.user_id = u.id GROUP BY u.id, u.first_name, u.last_name ORDER BY order_count DESC LIMIT 10\n\
             - SELECT * FROM products WHERE category = 'Electronics' LIMIT 100",
        ),
        Dialect::Document => (
            "Generate a COMPLETE read-only MongoDB shell expression using find, aggregate or countDocuments, \
             written as db.<collection>.<method>(...)",
            "Always include .limit(...) or a $limit stage to prevent large result sets",
            "- db.orders.find({\"status\": \"shipped\"}).sort({\"created_at\": -1}).limit(10)\n\
             - db.orders.aggregate([{\"$group\": {\"_id\": \"$user_id\", \"total\": {\"$sum\": \"$amount\"}}}, {\"$limit\": 10}])",
        ),
    };

    format!(
        "\nINSTRUCTIONS:\n\
         1. ANALYZE the schema first to understand relationships (e.g. user_id references users.id)\n\
         2. {complete}\n\
         3. {limit}\n\
         4. Only read data. Never modify, insert, delete or create anything\n\
         5. If you are unsure which {noun} or field to use, respond with \"{sentinel}: <your specific question>\" instead of guessing\n\n\
         Response format:\n\
         - If confident: return ONLY the complete query (no explanations, no comments, no markdown)\n\
         - If uncertain: return \"{sentinel}: <your specific question>\"\n\n\
         Example complete queries:\n{examples}",
        complete = complete,
        limit = limit,
        noun = dialect.relation_noun(),
        sentinel = CLARIFICATION_SENTINEL,
        examples = examples,
    )
}

/// User-turn text; rewritten when the user already picked a relation
pub fn generation_user_text(message: &str, selections: &[String], dialect: Dialect) -> String {
    if selections.is_empty() {
        return message.to_string();
    }

    let noun = dialect.relation_noun();
    let chosen = selections
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Original question: {}\n\
         Clarification: the user selected the {} {}.\n\
         Now generate the {} query using the selected {}. Do not ask for clarification about this again.",
        message,
        chosen,
        if selections.len() == 1 { noun.to_string() } else { format!("{}s", noun) },
        dialect.language(),
        noun
    )
}

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a data analyst assistant. Your job is to analyze query results and provide clear, insightful summaries in natural language.

Instructions:
1. Analyze the query and results to understand what was requested
2. Provide a conversational, insightful summary of the findings
3. Highlight key insights, patterns, or notable data points
4. Use natural language that a business user would understand
5. If there are interesting patterns or outliers, mention them

Keep your response to 2-3 sentences that provide genuine insight, not just restating the numbers.";

/// User-turn text for summarization
pub fn summary_user_text(question: &str, query: &str, rows_json: &str) -> String {
    format!(
        "User asked: \"{}\"\n\nQuery executed:\n{}\n\nResults:\n{}\n\nPlease provide an insightful summary of these results.",
        question, query, rows_json
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, RelationDescriptor};

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            Dialect::Relational,
            vec![RelationDescriptor::new(
                "users",
                vec![
                    FieldDescriptor::new("id", "integer").primary_key(),
                    FieldDescriptor::new("email", "text"),
                ],
            )],
        )
    }

    #[test]
    fn test_prompt_lists_schema_and_mapping() {
        let mut mapping = NameMapping::new();
        mapping.insert("customers".to_string(), "users".to_string());
        let prompt = generation_system_prompt(&schema(), &mapping, Dialect::Relational);

        assert!(prompt.contains("Table: users"));
        assert!(prompt.contains("  - id (integer) [PRIMARY KEY]"));
        assert!(prompt.contains("  - email (text)\n"));
        assert!(prompt.contains("Table Mappings:\n  - customers -> users"));
        assert!(prompt.contains("CLARIFICATION_NEEDED: <your specific question>"));
        assert!(prompt.contains("LIMIT"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let mapping = NameMapping::new();
        assert_eq!(
            generation_system_prompt(&schema(), &mapping, Dialect::Relational),
            generation_system_prompt(&schema(), &mapping, Dialect::Relational)
        );
    }

    #[test]
    fn test_user_text_with_selection() {
        let text = generation_user_text("show me orders", &["order_summary".to_string()], Dialect::Relational);
        assert!(text.contains("Original question: show me orders"));
        assert!(text.contains("\"order_summary\" table"));
        assert!(text.contains("Do not ask for clarification"));

        assert_eq!(generation_user_text("show me orders", &[], Dialect::Relational), "show me orders");
    }
}
