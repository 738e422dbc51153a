use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use nlq_engine::db::{init_pool, PgDatabase};
use nlq_engine::fallback::{FallbackChain, GenerationTier, ModelTier};
use nlq_engine::{
    AuditSink, ClarificationState, ConnectionRef, Conversation, Dialect, InMemoryAuditSink, JsonlAuditSink, LlmClient,
    MemoryClarificationStore, ModelProvider, NlqError, PipelineConfig, QueryExecutor, QueryGenerator, QueryPipeline,
    QueryValidator, ResultSummarizer, SchemaBundle, SchemaProvider, StaticSchemaProvider, TurnResponse,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Ask database questions in natural language")]
#[command(version)]
struct Args {
    /// JSON config file (defaults to environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question, or start an interactive session when none is given
    Ask {
        question: Option<String>,

        /// Schema bundle JSON file (otherwise introspected from the database)
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// PostgreSQL connection string (or set DATABASE_URL)
        #[arg(long)]
        database_url: Option<String>,

        /// API key for the chat-completions endpoint (or set OPENAI_API_KEY)
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        max_rows: Option<usize>,

        /// Append audit records to this JSON-lines file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Print responses as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether a query would be allowed to run
    Validate {
        query: String,

        #[arg(short, long, value_enum, default_value = "relational")]
        dialect: DialectArg,
    },
    /// Print the schema the pipeline would see
    Schema {
        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(long)]
        database_url: Option<String>,
    },
    /// Show audit log statistics and the most recent records
    Logs {
        /// JSON-lines audit file (or set NLQ_AUDIT_LOG)
        #[arg(long)]
        audit_log: Option<PathBuf>,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Print summary and records as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Relational,
    Document,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Relational => Dialect::Relational,
            DialectArg::Document => Dialect::Document,
        }
    }
}

const CONNECTION_ID: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path),
        None => PipelineConfig::from_env(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    match args.command {
        Commands::Ask {
            question,
            schema,
            database_url,
            api_key,
            max_rows,
            audit_log,
            json,
        } => {
            let mut config = config;
            config.api_key = api_key.or(config.api_key);
            config.database_url = database_url.or(config.database_url);
            config.max_rows = max_rows.unwrap_or(config.max_rows);
            config.audit_log = audit_log.or(config.audit_log);
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
            run_ask(config, schema, question, json).await
        }
        Commands::Validate { query, dialect } => run_validate(&query, dialect.into()),
        Commands::Schema { schema, database_url } => {
            run_schema(schema, database_url.or(config.database_url)).await
        }
        Commands::Logs {
            audit_log,
            limit,
            offset,
            json,
        } => run_logs(audit_log.or(config.audit_log), offset, limit, json),
    }
}

fn model_tiers(config: &PipelineConfig) -> Vec<Box<dyn GenerationTier>> {
    let Some(api_key) = &config.api_key else {
        info!("No API key configured, using keyword generation only");
        return Vec::new();
    };

    let mut models = vec![config.primary_model.clone()];
    models.extend(config.secondary_model.clone());

    models
        .into_iter()
        .map(|model| {
            let client = LlmClient::new(api_key.clone(), model, config.base_url.clone())
                .with_request_timeout(config.model_timeout());
            Box::new(ModelTier::new(Arc::new(client), config.model_timeout())) as Box<dyn GenerationTier>
        })
        .collect()
}

fn summarizer(config: &PipelineConfig) -> ResultSummarizer {
    match &config.api_key {
        Some(api_key) => {
            let client = LlmClient::new(api_key.clone(), config.primary_model.clone(), config.base_url.clone())
                .with_request_timeout(config.summary_timeout());
            let provider: Arc<dyn ModelProvider> = Arc::new(client);
            ResultSummarizer::new(provider, config.summary_timeout())
        }
        None => ResultSummarizer::deterministic(),
    }
}

async fn connect(database_url: Option<&str>) -> Result<PgDatabase> {
    let url = database_url.ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required to run queries"))?;
    let pool = init_pool(url, 10)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    info!("✅ Connected to database");
    Ok(PgDatabase::new(pool))
}

async fn run_ask(
    config: PipelineConfig,
    schema_path: Option<PathBuf>,
    question: Option<String>,
    json: bool,
) -> Result<()> {
    let database = connect(config.database_url.as_deref()).await?;

    let schema_provider: Arc<dyn SchemaProvider> = match &schema_path {
        Some(path) => {
            let bundle = SchemaBundle::load(path).map_err(|e| anyhow::anyhow!("Failed to load schema: {}", e))?;
            Arc::new(StaticSchemaProvider::new().with_bundle(CONNECTION_ID, bundle))
        }
        None => Arc::new(database.clone()),
    };

    let audit: Arc<dyn AuditSink> = match &config.audit_log {
        Some(path) => Arc::new(JsonlAuditSink::new(path.clone())),
        None => Arc::new(InMemoryAuditSink::new()),
    };

    let generator = QueryGenerator::new(FallbackChain::new(model_tiers(&config)));
    info!(tiers = ?generator.chain().tier_names(), "Generation tiers");

    let executor = QueryExecutor::new(Arc::new(database)).with_limits(config.execution_limits());
    let pipeline = QueryPipeline::new(
        schema_provider,
        Arc::new(generator),
        Arc::new(executor),
        Arc::new(summarizer(&config)),
        audit,
    );

    let conversation = Conversation::new(
        Arc::new(pipeline),
        Arc::new(MemoryClarificationStore::new()),
        ConnectionRef::new(CONNECTION_ID, Dialect::Relational),
    )
    .with_channel("cli");
    let conversation_id = whoami();

    match question {
        Some(question) => {
            let response = submit(&conversation, &conversation_id, &question).await?;
            print_response(response.as_ref(), json)?;
            while let ClarificationState::AwaitingClarification(context) = conversation.state(&conversation_id) {
                let choice = prompt(&format!("Your choice (1-{}): ", context.options.len()))?;
                if choice == "exit" {
                    break;
                }
                let response = submit(&conversation, &conversation_id, &choice).await?;
                print_response(response.as_ref(), json)?;
            }
        }
        None => {
            println!("Ask a question. Type 'reset' to abandon a clarification, 'exit' to quit.");
            loop {
                let label = match conversation.state(&conversation_id) {
                    ClarificationState::Idle => "> ",
                    ClarificationState::AwaitingClarification(_) => "choice> ",
                };
                let line = prompt(label)?;
                match line.as_str() {
                    "" => continue,
                    "exit" | "quit" => break,
                    "reset" => {
                        conversation.reset(&conversation_id);
                        continue;
                    }
                    _ => {}
                }
                let response = submit(&conversation, &conversation_id, &line).await?;
                print_response(response.as_ref(), json)?;
            }
        }
    }

    Ok(())
}

/// Submit input; clarification misses are reported and yield `None`
async fn submit(conversation: &Conversation, conversation_id: &str, input: &str) -> Result<Option<TurnResponse>> {
    match conversation.submit(conversation_id, input).await {
        Ok(response) => Ok(Some(response)),
        Err(NlqError::ClarificationPending { question, options }) => {
            println!("\nPlease pick one of the options first. {}", question);
            print_options(&options);
            Ok(None)
        }
        Err(e @ NlqError::InvalidSelection { .. }) => {
            println!("\n{}", e);
            Ok(None)
        }
        Err(e) => Err(anyhow::anyhow!("Turn failed: {}", e)),
    }
}

fn print_options(options: &[String]) {
    for (idx, option) in options.iter().enumerate() {
        println!("  {}. {}", idx + 1, option);
    }
}

fn print_response(response: Option<&TurnResponse>, json: bool) -> Result<()> {
    let Some(response) = response else {
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    match response {
        TurnResponse::Clarify { question, options } => {
            println!("\n{}", question);
            print_options(options);
        }
        TurnResponse::Answer { summary, query, rows } => {
            println!("\n{}", summary);
            println!("\nQuery: {}", query);
            println!("Rows ({}):", rows.len());
            for row in rows.iter().take(20) {
                println!("  {}", serde_json::to_string(row)?);
            }
            if rows.len() > 20 {
                println!("  ... {} more", rows.len() - 20);
            }
        }
        TurnResponse::Error {
            classification,
            message,
            detail,
        } => {
            println!("\n{}: {}", classification, message);
            if let Some(detail) = detail {
                println!("  Detail: {}", detail);
            }
            println!("  {}", classification.recommended_action());
        }
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Ok("exit".to_string());
    }
    Ok(input.trim().to_string())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli".to_string())
}

fn run_validate(query: &str, dialect: Dialect) -> Result<()> {
    match QueryValidator::validate(query, dialect) {
        Ok(validated) => {
            println!("✅ Allowed: {}", validated);
            Ok(())
        }
        Err(rejection) => Err(anyhow::anyhow!("Rejected: {}", rejection)),
    }
}

async fn run_schema(schema_path: Option<PathBuf>, database_url: Option<String>) -> Result<()> {
    let bundle = match schema_path {
        Some(path) => SchemaBundle::load(&path).map_err(|e| anyhow::anyhow!("Failed to load schema: {}", e))?,
        None => {
            let database = connect(database_url.as_deref()).await?;
            database
                .get_schema(&ConnectionRef::new(CONNECTION_ID, Dialect::Relational))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to introspect schema: {}", e))?
        }
    };
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

fn run_logs(audit_log: Option<PathBuf>, offset: usize, limit: usize, json: bool) -> Result<()> {
    let path = audit_log.ok_or_else(|| anyhow::anyhow!("No audit log configured (use --audit-log or NLQ_AUDIT_LOG)"))?;
    let sink = JsonlAuditSink::new(path);
    let summary = sink
        .summary()
        .map_err(|e| anyhow::anyhow!("Failed to read audit log: {}", e))?;
    let records = sink
        .recent(offset, limit)
        .map_err(|e| anyhow::anyhow!("Failed to read audit log: {}", e))?;

    if json {
        let out = serde_json::json!({ "summary": summary, "logs": records });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "📊 {} turns: {} succeeded, {} failed ({}% error rate)",
        summary.total, summary.successes, summary.errors, summary.error_rate
    );
    for record in &records {
        let outcome = match &record.error {
            Some(failure) => format!("❌ {} {}", failure.classification, failure.message),
            None => format!("✅ {} rows", record.rows.as_ref().map_or(0, Vec::len)),
        };
        println!(
            "\n{} [{}/{}] {}ms",
            record.timestamp.to_rfc3339(),
            record.channel,
            record.actor,
            record.execution_time_ms
        );
        println!("  Q: {}", record.original_message);
        if let Some(query) = &record.generated_query {
            println!("  {}", query);
        }
        println!("  {}", outcome);
    }
    Ok(())
}
