//! Pull a JSON value out of LLM output that may be wrapped in markdown or prose.

/// Extract the JSON object or array embedded in `text`.
///
/// Handles bare JSON, ```json fenced blocks, and JSON surrounded by prose.
/// Returns the trimmed input unchanged when nothing JSON-shaped is found so the
/// caller's parse error reports what the model actually said.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner;
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return &trimmed[start..=end];
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']'))
        && end > start
    {
        return &trimmed[start..=end];
    }

    trimmed
}

/// Parse the JSON embedded in `text`.
pub fn parse_embedded(text: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(extract_json(text))
}
