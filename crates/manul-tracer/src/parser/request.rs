//! Chat-completion request parsing

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::image::redact_image_blocks;
use super::ParseError;
use crate::models::{ImageDescriptor, MessageContent, Role};

/// Sampling and routing parameters of a request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestParams {
    /// Requested model
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// Completion token limit (`max_tokens`, or `max_completion_tokens` when absent)
    pub max_tokens: Option<i64>,
    /// Nucleus sampling mass
    pub top_p: Option<f64>,
    /// Frequency penalty
    pub frequency_penalty: Option<f64>,
    /// Presence penalty
    pub presence_penalty: Option<f64>,
    /// Sampling seed
    pub seed: Option<i64>,
    /// Stop sequences, normalized to a list
    pub stop: Vec<String>,
    /// Token bias map
    pub logit_bias: Option<BTreeMap<String, f64>>,
    /// Whether a streamed response was requested
    pub stream: bool,
}

/// One conversation turn as sent by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    /// Role of the turn
    pub role: Role,
    /// Content with inline images replaced by descriptors
    pub content: Option<MessageContent>,
    /// Whether the content carried image blocks
    pub has_images: bool,
}

/// Everything extracted from a request body
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedRequest {
    /// Sampling parameters
    pub params: RequestParams,
    /// Conversation turns in request order
    pub messages: Vec<ConversationTurn>,
    /// Inline images in order of appearance
    pub images: Vec<ImageDescriptor>,
}

impl ParsedRequest {
    /// Whether nothing was extracted
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.params == RequestParams::default()
    }
}

/// Parse a request body, reporting why nothing could be extracted
pub fn try_parse_request(body: &[u8]) -> Result<ParsedRequest, ParseError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(object) = value else {
        return Err(ParseError::NotAnObject);
    };

    let mut images = Vec::new();
    let messages = match object.get("messages") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|message| parse_turn(message, &mut images))
            .collect(),
        _ => Vec::new(),
    };

    Ok(ParsedRequest {
        params: parse_params(&object),
        messages,
        images,
    })
}

/// Parse a request body, yielding an empty result for anything unparseable.
///
/// Tracing must never interfere with the call, so a body that is not a JSON
/// object simply produces no request metadata.
pub fn parse_request(body: &[u8]) -> ParsedRequest {
    match try_parse_request(body) {
        Ok(parsed) => parsed,
        Err(ParseError::Empty) => ParsedRequest::default(),
        Err(err) => {
            tracing::debug!(error = %err, "Request body not traceable");
            ParsedRequest::default()
        }
    }
}

fn parse_params(object: &Map<String, Value>) -> RequestParams {
    let float = |key: &str| object.get(key).and_then(Value::as_f64);
    let int = |key: &str| object.get(key).and_then(Value::as_i64);

    let stop = match object.get("stop") {
        Some(Value::String(stop)) => vec![stop.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };

    let logit_bias = object.get("logit_bias").and_then(Value::as_object).map(|bias| {
        bias.iter()
            .filter_map(|(token, weight)| weight.as_f64().map(|w| (token.clone(), w)))
            .collect()
    });

    RequestParams {
        model: object.get("model").and_then(Value::as_str).map(String::from),
        temperature: float("temperature"),
        max_tokens: int("max_tokens").or_else(|| int("max_completion_tokens")),
        top_p: float("top_p"),
        frequency_penalty: float("frequency_penalty"),
        presence_penalty: float("presence_penalty"),
        seed: int("seed"),
        stop,
        logit_bias,
        stream: object.get("stream").and_then(Value::as_bool).unwrap_or(false),
    }
}

fn parse_turn(message: &Map<String, Value>, images: &mut Vec<ImageDescriptor>) -> ConversationTurn {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .map_or_else(|| Role::Other("unknown".to_string()), Role::from);

    let (content, has_images) = match message.get("content") {
        None | Some(Value::Null) => (None, false),
        Some(Value::String(text)) => (Some(MessageContent::Text(text.clone())), false),
        Some(Value::Array(parts)) => {
            let (parts, has_images) = redact_image_blocks(parts.clone(), images);
            (Some(MessageContent::Parts(parts)), has_images)
        }
        Some(Value::Object(block)) => {
            let (parts, has_images) =
                redact_image_blocks(vec![Value::Object(block.clone())], images);
            (Some(MessageContent::Parts(parts)), has_images)
        }
        Some(other) => (Some(MessageContent::Text(other.to_string())), false),
    };

    ConversationTurn {
        role,
        content,
        has_images,
    }
}
