// ai-writer-service/src/error.rs

use thiserror::Error;

use crate::models::ViewKind;
use crate::pipeline::Stage;

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Transport-level failures from the LLM chat endpoint.
///
/// The chat client never retries; the pipeline owns retry policy so that
/// every attempt is charged against the budget.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Chat API rejected credentials")]
    Unauthorized,

    #[error("Rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Chat request timed out")]
    Timeout,

    #[error("Chat API returned error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Chat request failed: {0}")]
    Network(String),

    #[error("Chat response malformed: {0}")]
    Malformed(String),
}

impl ChatError {
    /// True for failures worth exactly one retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::RateLimited { .. } | ChatError::Timeout)
    }
}

/// Failures from the image search API. Never fatal to a generation.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image search request failed: {0}")]
    Request(String),

    #[error("Image search returned status {0}")]
    Status(u16),

    #[error("Image search response malformed: {0}")]
    Malformed(String),
}

/// Failures turning raw model text into a `GenerationResult`.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Model output is not a JSON object: {0}")]
    Malformed(String),

    #[error("Model output missing required views: {missing:?}")]
    IncompleteOutput { missing: Vec<ViewKind> },
}

/// Top-level error for one generation request.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Daily token budget exhausted ({remaining} tokens remaining)")]
    BudgetExceeded { remaining: u64 },

    #[error("Transport error: {0}")]
    Transport(#[from] ChatError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Generation cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("Internal error during {stage}: {source}")]
    Internal {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl GenerationError {
    pub fn error_type(&self) -> &'static str {
        match self {
            GenerationError::InvalidRequest(_) => "invalid_request",
            GenerationError::BudgetExceeded { .. } => "budget_exceeded",
            GenerationError::Transport(ChatError::Unauthorized) => "unauthorized",
            GenerationError::Transport(ChatError::RateLimited { .. }) => "rate_limited",
            GenerationError::Transport(ChatError::Timeout) => "timeout",
            GenerationError::Transport(ChatError::ServerError { .. }) => "server_error",
            GenerationError::Transport(ChatError::Network(_)) => "network_error",
            GenerationError::Transport(ChatError::Malformed(_)) => "malformed_response",
            GenerationError::Validation(ValidationError::Malformed(_)) => "validation_malformed",
            GenerationError::Validation(ValidationError::IncompleteOutput { .. }) => {
                "validation_incomplete"
            }
            GenerationError::Cancelled { .. } => "cancelled",
            GenerationError::Internal { .. } => "internal_error",
        }
    }

    /// One human-readable sentence per error kind. Detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            GenerationError::InvalidRequest(reason) => {
                format!("The request could not be processed: {reason}")
            }
            GenerationError::BudgetExceeded { .. } => {
                "The daily AI usage limit has been reached. Try again tomorrow.".to_string()
            }
            GenerationError::Transport(ChatError::Unauthorized) => {
                "The AI service rejected the configured credentials.".to_string()
            }
            GenerationError::Transport(_) => {
                "The AI service could not be reached. Check your connection and try again."
                    .to_string()
            }
            GenerationError::Validation(_) => {
                "The AI returned something the app didn't understand. Please try again."
                    .to_string()
            }
            GenerationError::Cancelled { .. } => "The generation was cancelled.".to_string(),
            GenerationError::Internal { .. } => {
                "Something went wrong while generating the document.".to_string()
            }
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.user_message(),
            error_type: self.error_type().to_string(),
            detail: self.to_string(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: String,
    pub detail: String,
}
