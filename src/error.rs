use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Model provider error: {0}")]
    Provider(String),

    #[error("Provider '{provider}' timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    #[error("Query generation failed: {0}")]
    GenerationFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Clarification pending: {question} (choose one of: {})", .options.join(", "))]
    ClarificationPending {
        question: String,
        options: Vec<String>,
    },

    #[error("Invalid clarification selection '{selection}' (choose one of: {})", .options.join(", "))]
    InvalidSelection {
        selection: String,
        options: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for NlqError {
    fn from(err: sqlx::Error) -> Self {
        NlqError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;
