//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rig::completion::{AssistantContent, CompletionError, CompletionModel, Message};

use crate::error::LlmError;

use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Provider error text is truncated to this many bytes.
const ERROR_BODY_LIMIT: usize = 300;

/// A status code the HTTP layer put in its error text.
static STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bstatus(?:\s+code)?\s*[:=]?\s*|\()([1-5]\d{2})\b").expect("static regex")
});

/// Error types from Anthropic and OpenAI error bodies, mapped to the status
/// the API sends them with.
static ERROR_TYPES: LazyLock<Vec<(Regex, u16)>> = LazyLock::new(|| {
    [
        (r"authentication_error|invalid_api_key|invalid x-api-key|incorrect api key", 401),
        (r"permission_error|insufficient_permissions", 403),
        (r"not_found_error|model_not_found", 404),
        (r"rate_limit_error|rate_limit_exceeded|insufficient_quota", 429),
        (r"invalid_request_error|context_length_exceeded", 400),
        (r"overloaded_error", 529),
        (r"\bapi_error\b|server_error", 500),
    ]
    .into_iter()
    .map(|(pattern, status)| {
        let regex = Regex::new(&format!("(?i){pattern}")).expect("static regex");
        (regex, status)
    })
    .collect()
});

type ModelFactory<M> = Box<dyn Fn(&str) -> M + Send + Sync>;

/// Wraps a rig completion model.
///
/// `make_model` builds a model by name from the same client, for requests
/// that override the default model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
    make_model: ModelFactory<M>,
    timeout: Duration,
}

impl<M: CompletionModel + 'static> RigAdapter<M> {
    pub fn new(
        provider: &'static str,
        model_name: &str,
        make_model: impl Fn(&str) -> M + Send + Sync + 'static,
        timeout: Duration,
    ) -> Self {
        Self {
            model: make_model(model_name),
            model_name: model_name.to_string(),
            provider,
            make_model: Box::new(make_model),
            timeout,
        }
    }

    fn model_for(&self, request: &CompletionRequest) -> M {
        match request.model.as_deref() {
            Some(name) if name != self.model_name => (self.make_model)(name),
            _ => self.model.clone(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut turns: Vec<Message> = request.conversation().map(to_rig_message).collect();
        let prompt = turns.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "request has no user message".to_string(),
        })?;

        let model = self.model_for(&request);
        let mut builder = model.completion_request(prompt).messages(turns);
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(system.to_string());
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| map_completion_error(self.provider, &e))?;

        let texts: Vec<&str> = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        Ok(CompletionResponse {
            content: texts.concat(),
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
            finish_reason: if texts.is_empty() {
                FinishReason::Unknown
            } else {
                FinishReason::Stop
            },
        })
    }
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::User | Role::System => Message::user(message.content.clone()),
    }
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Turn a rig error into an `LlmError` whose `Display` carries the HTTP
/// status when one can be recovered from the error text.
pub(crate) fn map_completion_error(provider: &str, err: &CompletionError) -> LlmError {
    let message = err.to_string();
    let status = STATUS
        .captures(&message)
        .and_then(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .filter(|status| *status >= 400)
        .or_else(|| {
            ERROR_TYPES
                .iter()
                .find(|(regex, _)| regex.is_match(&message))
                .map(|(_, status)| *status)
        });

    match status {
        Some(401) => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        Some(429) => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        },
        Some(status) => LlmError::Http {
            provider: provider.to_string(),
            status,
            body: super::truncate(&message, ERROR_BODY_LIMIT),
        },
        None => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::classify::is_permanent_error;

    fn provider_error(body: &str) -> LlmError {
        map_completion_error("anthropic", &CompletionError::ProviderError(body.to_string()))
    }

    #[test]
    fn auth_error_body_is_permanent() {
        let err = provider_error(
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        assert!(is_permanent_error(&err.to_string()));
    }

    #[test]
    fn overloaded_renders_529_and_retries() {
        let err = provider_error(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        let text = err.to_string();
        assert!(text.contains("(529)"), "{text}");
        assert!(!is_permanent_error(&text));
    }

    #[test]
    fn explicit_status_wins_over_error_type() {
        let err = provider_error("Invalid status code 404 Not Found: rate_limit_exceeded");
        assert!(matches!(err, LlmError::Http { status: 404, .. }));
    }

    #[test]
    fn openai_rate_limit_is_transient() {
        let err = provider_error(r#"{"error":{"code":"rate_limit_exceeded"}}"#);
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert!(!is_permanent_error(&err.to_string()));
    }

    #[test]
    fn unrecognized_error_is_a_plain_request_failure() {
        let err = provider_error("connection reset by peer");
        assert!(matches!(err, LlmError::RequestFailed { .. }));
        assert!(!is_permanent_error(&err.to_string()));
    }
}
