//! PostgreSQL adapter
//!
//! Introspects the `public` schema and runs validated queries inside a
//! read-only transaction with a local statement timeout.

use crate::error::{NlqError, Result};
use crate::executor::{AdapterError, DatabaseAdapter, ExecutionLimits, Row};
use crate::schema::{
    ConnectionRef, Dialect, FieldDescriptor, NameMapping, RelationDescriptor, SchemaBundle, SchemaDescriptor,
    SchemaProvider,
};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

const SCHEMA_QUERY: &str = r#"
    SELECT
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        (pk.column_name IS NOT NULL) AS is_primary
    FROM information_schema.columns c
    LEFT JOIN (
        SELECT ku.table_name, ku.column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage ku
          ON tc.constraint_name = ku.constraint_name
         AND tc.table_schema = ku.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema = 'public'
    ) pk ON c.table_name = pk.table_name AND c.column_name = pk.column_name
    WHERE c.table_schema = 'public'
    ORDER BY c.table_name, c.ordinal_position
"#;

/// PostgreSQL-backed schema provider and database adapter
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    mapping: NameMapping,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            mapping: NameMapping::new(),
        }
    }

    /// Semantic names to attach to every introspected schema
    pub fn with_mapping(mut self, mapping: NameMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub async fn introspect(&self) -> Result<SchemaDescriptor> {
        let rows: Vec<(String, String, String, bool)> = sqlx::query_as(SCHEMA_QUERY).fetch_all(&self.pool).await?;

        let mut relations: Vec<RelationDescriptor> = Vec::new();
        for (table, column, data_type, is_primary) in rows {
            let mut field = FieldDescriptor::new(column, data_type);
            field.is_primary_key = is_primary;

            match relations.last_mut() {
                Some(last) if last.name == table => last.fields.push(field),
                _ => relations.push(RelationDescriptor::new(table, vec![field])),
            }
        }

        info!(relations = relations.len(), "Introspected PostgreSQL schema");
        Ok(SchemaDescriptor::new(Dialect::Relational, relations))
    }
}

/// Wrap a query so each row comes back as one JSON object, with one row
/// beyond the cap so truncation can be detected. The closing paren goes on
/// its own line so a trailing `--` comment cannot swallow it.
fn wrap_query(text: &str, max_rows: usize) -> String {
    format!(
        "SELECT row_to_json(t)::text FROM ({}\n) t LIMIT {}",
        text,
        max_rows.saturating_add(1)
    )
}

#[async_trait]
impl SchemaProvider for PgDatabase {
    async fn get_schema(&self, connection: &ConnectionRef) -> Result<SchemaBundle> {
        if connection.dialect != Dialect::Relational {
            return Err(NlqError::Schema(format!(
                "PostgreSQL cannot describe {} connection {}",
                connection.dialect, connection.id
            )));
        }
        Ok(SchemaBundle::new(self.introspect().await?).with_mapping(self.mapping.clone()))
    }
}

#[async_trait]
impl DatabaseAdapter for PgDatabase {
    async fn run(
        &self,
        connection: &ConnectionRef,
        text: &str,
        limits: &ExecutionLimits,
    ) -> std::result::Result<Vec<Row>, AdapterError> {
        if connection.dialect != Dialect::Relational {
            return Err(AdapterError::new(format!(
                "PostgreSQL cannot run {} queries",
                connection.dialect
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            limits.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let wrapped = wrap_query(text, limits.max_rows);
        debug!("Executing: {}", wrapped);
        let json_rows: Vec<String> = sqlx::query_scalar(&wrapped).fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        json_rows
            .iter()
            .map(|raw| {
                serde_json::from_str::<Row>(raw)
                    .map_err(|e| AdapterError::new(format!("Failed to decode row: {}", e)))
            })
            .collect()
    }
}
