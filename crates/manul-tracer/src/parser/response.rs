//! Chat-completion response parsing, buffered JSON or server-sent events

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

/// SSE payload prefix
const DATA_PREFIX: &str = "data:";
/// SSE stream terminator
const DONE_SENTINEL: &str = "[DONE]";

/// Token usage reported by the API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: i64,
    /// Tokens in the completion
    pub completion_tokens: i64,
    /// Prompt plus completion tokens
    pub total_tokens: i64,
    /// Prompt tokens served from cache
    pub prompt_cached_tokens: Option<i64>,
    /// Audio tokens in the prompt
    pub prompt_audio_tokens: Option<i64>,
    /// Reasoning tokens in the completion
    pub completion_reasoning_tokens: Option<i64>,
    /// Audio tokens in the completion
    pub completion_audio_tokens: Option<i64>,
    /// Predicted tokens that appeared in the completion
    pub completion_accepted_prediction_tokens: Option<i64>,
    /// Predicted tokens that did not
    pub completion_rejected_prediction_tokens: Option<i64>,
}

impl TokenUsage {
    fn from_value(usage: &Value) -> Option<Self> {
        let usage = usage.as_object()?;
        let count = |key: &str| usage.get(key).and_then(Value::as_i64);
        let detail = |group: &str, key: &str| {
            usage
                .get(group)
                .and_then(|details| details.get(key))
                .and_then(Value::as_i64)
        };

        let prompt_tokens = count("prompt_tokens").unwrap_or(0);
        let completion_tokens = count("completion_tokens").unwrap_or(0);
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: count("total_tokens").unwrap_or(prompt_tokens + completion_tokens),
            prompt_cached_tokens: detail("prompt_tokens_details", "cached_tokens"),
            prompt_audio_tokens: detail("prompt_tokens_details", "audio_tokens"),
            completion_reasoning_tokens: detail("completion_tokens_details", "reasoning_tokens"),
            completion_audio_tokens: detail("completion_tokens_details", "audio_tokens"),
            completion_accepted_prediction_tokens: detail(
                "completion_tokens_details",
                "accepted_prediction_tokens",
            ),
            completion_rejected_prediction_tokens: detail(
                "completion_tokens_details",
                "rejected_prediction_tokens",
            ),
        })
    }
}

/// Rate-limit state reported in response headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    /// `x-ratelimit-limit-requests`
    pub requests_limit: Option<i64>,
    /// `x-ratelimit-remaining-requests`
    pub requests_remaining: Option<i64>,
    /// `x-ratelimit-limit-tokens`
    pub tokens_limit: Option<i64>,
    /// `x-ratelimit-remaining-tokens`
    pub tokens_remaining: Option<i64>,
}

impl RateLimits {
    /// Read the `x-ratelimit-*` headers; unparseable values are ignored
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<i64>().ok())
        };

        Self {
            requests_limit: read("x-ratelimit-limit-requests"),
            requests_remaining: read("x-ratelimit-remaining-requests"),
            tokens_limit: read("x-ratelimit-limit-tokens"),
            tokens_remaining: read("x-ratelimit-remaining-tokens"),
        }
    }
}

/// Everything extracted from a response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedResponse {
    /// HTTP status of the response
    pub status: u16,
    /// Token usage, zeros when the response reported none
    pub usage: TokenUsage,
    /// Why generation stopped
    pub finish_reason: Option<String>,
    /// Upstream response id
    pub response_id: Option<String>,
    /// Model that served the request
    pub model: Option<String>,
    /// Assistant reply text of the first choice
    pub assistant_content: Option<String>,
    /// Rate-limit headers
    pub rate_limits: RateLimits,
    /// Whether the body was read as an event stream
    pub streamed: bool,
    /// Number of stream events that were parsed
    pub chunk_count: usize,
    /// Number of stream events that were not valid JSON
    pub skipped_chunks: usize,
}

/// Parse a fully captured response body.
///
/// The body is treated as an event stream when `streaming` is set or when it
/// starts with an SSE `data:` line. Malformed content never fails the parse;
/// whatever could be read is returned.
pub fn parse_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    streaming: bool,
) -> ParsedResponse {
    let text = String::from_utf8_lossy(body);
    let streamed = streaming || text.trim_start().starts_with(DATA_PREFIX);

    let mut parsed = if streamed {
        parse_event_stream(&text)
    } else {
        parse_json_body(body)
    };
    parsed.status = status.as_u16();
    parsed.streamed = streamed;
    parsed.rate_limits = RateLimits::from_headers(headers);
    parsed
}

fn parse_json_body(body: &[u8]) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            if !body.is_empty() {
                tracing::debug!(error = %err, "Response body is not JSON");
            }
            return parsed;
        }
    };

    if let Some(usage) = value.get("usage").and_then(TokenUsage::from_value) {
        parsed.usage = usage;
    }
    parsed.response_id = string_field(&value, "id");
    parsed.model = string_field(&value, "model");

    if let Some(choice) = first_choice(&value) {
        parsed.finish_reason = string_field(choice, "finish_reason");
        parsed.assistant_content = choice
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(content_text)
            .or_else(|| string_field(choice, "text"));
    }
    parsed
}

fn parse_event_stream(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    let mut fragments: Option<String> = None;

    for line in text.lines() {
        let Some(payload) = line.trim().strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == DONE_SENTINEL {
            continue;
        }

        let chunk: Value = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(_) => {
                parsed.skipped_chunks += 1;
                continue;
            }
        };
        parsed.chunk_count += 1;

        if parsed.response_id.is_none() {
            parsed.response_id = string_field(&chunk, "id");
        }
        if parsed.model.is_none() {
            parsed.model = string_field(&chunk, "model");
        }
        // Usage usually arrives on a final chunk with no choices; the last one wins
        if let Some(usage) = chunk.get("usage").and_then(TokenUsage::from_value) {
            parsed.usage = usage;
        }

        if let Some(choice) = first_choice(&chunk) {
            if let Some(reason) = string_field(choice, "finish_reason") {
                parsed.finish_reason = Some(reason);
            }
            if let Some(delta) = choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
            {
                fragments.get_or_insert_with(String::new).push_str(delta);
            }
        }
    }

    if parsed.skipped_chunks > 0 {
        tracing::debug!(skipped = parsed.skipped_chunks, "Skipped malformed stream events");
    }
    parsed.assistant_content = fragments;
    parsed
}

fn first_choice(value: &Value) -> Option<&Value> {
    value.get("choices")?.as_array()?.first()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// Text of a message `content`, joining text blocks when it is a list
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn parse(body: &[u8], streaming: bool) -> ParsedResponse {
        parse_response(StatusCode::OK, &HeaderMap::new(), body, streaming)
    }

    #[test]
    fn test_parses_buffered_completion() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi there"},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 3,
                "total_tokens": 15,
                "prompt_tokens_details": {"cached_tokens": 8, "audio_tokens": 0},
                "completion_tokens_details": {"reasoning_tokens": 1}
            }
        });
        let parsed = parse(&serde_json::to_vec(&body).unwrap(), false);

        assert!(!parsed.streamed);
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.response_id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(parsed.assistant_content.as_deref(), Some("Hi there"));
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.usage.prompt_tokens, 12);
        assert_eq!(parsed.usage.total_tokens, 15);
        assert_eq!(parsed.usage.prompt_cached_tokens, Some(8));
        assert_eq!(parsed.usage.prompt_audio_tokens, Some(0));
        assert_eq!(parsed.usage.completion_reasoning_tokens, Some(1));
        assert_eq!(parsed.usage.completion_audio_tokens, None);
    }

    #[test]
    fn test_parses_event_stream() {
        let body = concat!(
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        let parsed = parse(body.as_bytes(), true);

        assert!(parsed.streamed);
        assert_eq!(parsed.chunk_count, 4);
        assert_eq!(parsed.assistant_content.as_deref(), Some("Hello"));
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.response_id.as_deref(), Some("c1"));
        assert_eq!(parsed.usage.total_tokens, 7);
    }

    #[test]
    fn test_stream_detected_without_hint() {
        let body = b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n";
        let parsed = parse(body, false);
        assert!(parsed.streamed);
        assert_eq!(parsed.assistant_content.as_deref(), Some("x"));
    }

    #[test]
    fn test_malformed_stream_events_are_skipped() {
        let body = "data: {broken\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n: keep-alive\n\n";
        let parsed = parse(body.as_bytes(), true);
        assert_eq!(parsed.skipped_chunks, 1);
        assert_eq!(parsed.chunk_count, 1);
        assert_eq!(parsed.assistant_content.as_deref(), Some("ok"));
        assert_eq!(parsed.usage, TokenUsage::default());
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let parsed = parse(b"{\"choices\":[]}", false);
        assert_eq!(parsed.usage.prompt_tokens, 0);
        assert_eq!(parsed.usage.completion_tokens, 0);
        assert_eq!(parsed.usage.total_tokens, 0);
        assert_eq!(parsed.assistant_content, None);
    }

    #[test]
    fn test_invalid_json_yields_defaults() {
        let parsed = parse(b"<html>bad gateway</html>", false);
        assert_eq!(parsed.usage, TokenUsage::default());
        assert_eq!(parsed.response_id, None);
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit-requests", HeaderValue::from_static("500"));
        headers.insert("x-ratelimit-remaining-requests", HeaderValue::from_static("499"));
        headers.insert("x-ratelimit-limit-tokens", HeaderValue::from_static("30000"));
        headers.insert("x-ratelimit-remaining-tokens", HeaderValue::from_static("soon"));

        let parsed = parse_response(StatusCode::OK, &headers, b"{}", false);
        assert_eq!(parsed.rate_limits.requests_limit, Some(500));
        assert_eq!(parsed.rate_limits.requests_remaining, Some(499));
        assert_eq!(parsed.rate_limits.tokens_limit, Some(30000));
        assert_eq!(parsed.rate_limits.tokens_remaining, None);
    }

    #[test]
    fn test_total_tokens_falls_back_to_sum() {
        let usage = TokenUsage::from_value(&json!({"prompt_tokens": 3, "completion_tokens": 4})).unwrap();
        assert_eq!(usage.total_tokens, 7);
    }

    proptest::proptest! {
        #[test]
        fn stream_deltas_join_and_last_usage_wins(
            events in proptest::collection::vec(
                ("[a-zA-Z0-9 .,!?]{0,8}", proptest::option::of((0i64..5000, 0i64..5000))),
                1..24,
            )
        ) {
            let mut body = String::new();
            for (delta, usage) in &events {
                let mut chunk = json!({"choices": [{"index": 0, "delta": {"content": delta}}]});
                if let Some((prompt, completion)) = usage {
                    chunk["usage"] = json!({
                        "prompt_tokens": prompt,
                        "completion_tokens": completion,
                        "total_tokens": prompt + completion
                    });
                }
                body.push_str(&format!("data: {chunk}\n\n"));
            }
            body.push_str("data: [DONE]\n\n");

            let parsed = parse(body.as_bytes(), true);
            let expected: String = events.iter().map(|(delta, _)| delta.as_str()).collect();
            proptest::prop_assert_eq!(parsed.assistant_content, Some(expected));

            let last_usage = events.iter().rev().find_map(|(_, usage)| *usage);
            let (prompt, completion) = last_usage.unwrap_or((0, 0));
            proptest::prop_assert_eq!(parsed.usage.prompt_tokens, prompt);
            proptest::prop_assert_eq!(parsed.usage.completion_tokens, completion);
            proptest::prop_assert_eq!(parsed.chunk_count, events.len());
        }
    }
}
