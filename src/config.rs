//! Configuration types.
//!
//! Everything is read from environment variables; each struct has a `Default`
//! so tests and embedders can build one directly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Dead-letter queue retention.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Dead-lettered jobs older than this are dropped.
    pub max_age_days: u32,
    /// At most this many dead-lettered jobs are kept.
    pub max_count: usize,
    /// How often the trim task runs.
    pub trim_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_age_days: 14,
            max_count: 50,
            trim_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Executor settings passed with every LLM call.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Overrides the provider's default model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Whole-process configuration for the `memoria` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub executor: ExecutorConfig,
    pub dlq: DlqConfig,
    pub snapshot_path: PathBuf,
    pub snapshot_debounce: Duration,
    /// Admin HTTP port; `None` disables the admin API.
    pub admin_port: Option<u16>,
    /// Subject whose conversation stdin feeds.
    pub subject_id: String,
    pub subject_name: String,
    /// Directory for daily-rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = env_parse("MEMORIA_BACKEND", LlmBackend::Anthropic)?;
        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o"),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model: env_or("MEMORIA_MODEL", default_model),
            timeout: nonzero_secs(
                "MEMORIA_LLM_TIMEOUT_SECS",
                env_parse("MEMORIA_LLM_TIMEOUT_SECS", 120u64)?,
            )?,
        };

        let defaults = DlqConfig::default();
        let dlq = DlqConfig {
            max_age_days: env_parse("MEMORIA_DLQ_MAX_AGE_DAYS", defaults.max_age_days)?,
            max_count: env_parse("MEMORIA_DLQ_MAX_COUNT", defaults.max_count)?,
            trim_interval: nonzero_secs(
                "MEMORIA_DLQ_TRIM_INTERVAL_SECS",
                env_parse("MEMORIA_DLQ_TRIM_INTERVAL_SECS", defaults.trim_interval.as_secs())?,
            )?,
        };

        let admin_port = match std::env::var("MEMORIA_ADMIN_PORT") {
            Ok(v) if v.eq_ignore_ascii_case("off") => None,
            Ok(v) => Some(parse_value("MEMORIA_ADMIN_PORT", &v)?),
            Err(_) => Some(8090),
        };

        let subject_id = env_or("MEMORIA_SUBJECT_ID", "ei");
        Ok(Self {
            llm,
            executor: ExecutorConfig {
                model: std::env::var("MEMORIA_EXTRACTION_MODEL").ok(),
                max_tokens: Some(env_parse("MEMORIA_MAX_TOKENS", 2048u32)?),
                temperature: None,
            },
            dlq,
            snapshot_path: PathBuf::from(env_or("MEMORIA_SNAPSHOT_PATH", "./data/queue.json")),
            snapshot_debounce: Duration::from_millis(env_parse(
                "MEMORIA_SNAPSHOT_DEBOUNCE_MS",
                2000u64,
            )?),
            admin_port,
            subject_name: env_or("MEMORIA_SUBJECT_NAME", &subject_id),
            subject_id,
            log_dir: std::env::var("MEMORIA_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn nonzero_secs(key: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        })
}
