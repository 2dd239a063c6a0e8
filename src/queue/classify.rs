//! Permanent-vs-transient failure classification.
//!
//! A failure is permanent when it carries a 4xx status other than 408 (request
//! timeout) or 429 (rate limit), or when its text reads like an authentication
//! or malformed-request error. Everything else, including messages we don't
//! recognize at all, is transient and goes back into the retry pool.

use std::sync::LazyLock;

use regex::Regex;

/// `(401)`, the form `LlmError` renders status codes in.
static PAREN_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d{3})\)").expect("static regex"));

/// `status 403`, `status code: 404`, `HTTP 400`, `http=422`.
static LABELED_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:status(?:\s+code)?|http)\s*[:=]?\s*(\d{3})\b").expect("static regex")
});

static PERMANENT_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(authentication (?:failed|error)|unauthori[sz]ed|invalid[ _-]?api[ _-]?key|invalid x-api-key|permission denied|bad request|invalid_request_error|malformed request)",
    )
    .expect("static regex")
});

/// HTTP statuses that look like client errors but are worth retrying.
const RETRYABLE_4XX: [u16; 2] = [408, 429];

/// Every three-digit status code mentioned in `message`.
fn status_codes(message: &str) -> impl Iterator<Item = u16> + '_ {
    PAREN_STATUS
        .captures_iter(message)
        .chain(LABELED_STATUS.captures_iter(message))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
}

fn is_permanent_status(status: u16) -> bool {
    (400..500).contains(&status) && !RETRYABLE_4XX.contains(&status)
}

/// Should a failure with this message skip retries and go to the DLQ?
pub fn is_permanent_error(message: &str) -> bool {
    status_codes(message).any(is_permanent_status) || PERMANENT_TEXT.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent() {
        assert!(is_permanent_error("(400)"));
        assert!(is_permanent_error("(401)"));
        assert!(is_permanent_error("Provider openai returned HTTP error (404): no such model"));
        assert!(is_permanent_error("request failed with status code: 422"));
    }

    #[test]
    fn retryable_statuses_are_transient() {
        assert!(!is_permanent_error("(429)"));
        assert!(!is_permanent_error("(408)"));
        assert!(!is_permanent_error("(503)"));
        assert!(!is_permanent_error("(529)"));
        assert!(!is_permanent_error("Provider anthropic rate limited (429), retry after None"));
    }

    #[test]
    fn auth_text_is_permanent() {
        assert!(is_permanent_error("Authentication failed for provider anthropic"));
        assert!(is_permanent_error("Invalid API key provided"));
        assert!(is_permanent_error("Bad Request: messages must alternate"));
    }

    #[test]
    fn unrecognized_defaults_to_transient() {
        assert!(!is_permanent_error("connection reset by peer"));
        assert!(!is_permanent_error("JSON parse failed: EOF while parsing an object"));
        assert!(!is_permanent_error(""));
    }
}
