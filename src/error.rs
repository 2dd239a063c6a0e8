//! Error types for memoria.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
///
/// The `Display` output is what ends up in a job's `last_error` and is fed to
/// the permanent-error classifier, so HTTP failures always render their status
/// code as `(NNN)`.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP error ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} rate limited (429), retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Snapshot persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Executor errors (as opposed to job failures, which are ordinary results).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor is busy with job {current}")]
    Busy { current: Uuid },
}

/// Prompt construction errors.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt validation failed: {0}")]
    Validation(String),
}

/// Knowledge-base errors.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Invalid {category}: {reason}")]
    InvalidEntity { category: String, reason: String },
}

/// Errors raised while routing a completed job to its handler.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Knowledge base error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Job {id} routed to {expected} handler with a {actual} payload")]
    PayloadMismatch {
        id: Uuid,
        expected: String,
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_renders_status_in_parens() {
        let err = LlmError::Http {
            provider: "anthropic".into(),
            status: 401,
            body: "invalid x-api-key".into(),
        };
        assert!(err.to_string().contains("(401)"));
    }

    #[test]
    fn rate_limit_renders_429() {
        let err = LlmError::RateLimited {
            provider: "openai".into(),
            retry_after: None,
        };
        assert!(err.to_string().contains("(429)"));
    }
}
