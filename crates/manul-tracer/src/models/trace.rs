//! Trace data model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ImageDescriptor, Message};
use crate::parser::{ParsedResponse, RateLimits, RequestParams};

/// Fields that describe the completeness bookkeeping itself and are left out
/// of the completeness count.
const BOOKKEEPING_FIELDS: [&str; 2] = ["data_completeness_score", "missing_fields"];

/// Status of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Request sent, response not yet fully observed
    #[default]
    Pending,
    /// Response fully captured and parsed
    Complete,
    /// Request failed at the transport or HTTP level
    Error,
}

impl TraceStatus {
    /// Storage name of the status
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Whether no further transition is allowed
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraceStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::validation(format!("unknown trace status '{other}'"))),
        }
    }
}

/// Everything observed about one outbound API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    // Identity
    /// Unique identifier
    pub trace_id: String,
    /// Session the call belongs to
    pub session_id: String,
    /// User the session belongs to
    pub user_id: Option<String>,
    /// Requested model
    pub model_id: Option<String>,

    // Request snapshot
    /// Full request URL
    pub endpoint: Option<String>,
    /// Client version taken from the user agent
    pub api_version: Option<String>,
    /// When the request was handed to the transport
    pub request_timestamp: Option<DateTime<Utc>>,
    /// When the response headers arrived
    pub response_timestamp: Option<DateTime<Utc>>,
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// Completion token limit
    pub max_tokens: Option<i64>,
    /// Nucleus sampling mass
    pub top_p: Option<f64>,
    /// Frequency penalty
    pub frequency_penalty: Option<f64>,
    /// Presence penalty
    pub presence_penalty: Option<f64>,
    /// Whether a streamed response was requested
    pub stream: Option<bool>,
    /// Stop sequences
    pub stop_sequences: Vec<String>,
    /// Token bias map
    pub logit_bias: Option<BTreeMap<String, f64>>,
    /// Sampling seed
    pub seed: Option<i64>,
    /// Size of the request body
    pub request_size_bytes: Option<i64>,

    // Conversation
    /// Ordered conversation turns, assistant reply last once captured
    pub conversation: Vec<Message>,
    /// Images found in the request
    pub images: Vec<ImageDescriptor>,

    // Response snapshot
    /// Why generation stopped
    pub finish_reason: Option<String>,
    /// Index of the choice that was traced
    pub choice_index: Option<i64>,
    /// Upstream response id
    pub response_id: Option<String>,
    /// Prompt tokens
    pub prompt_tokens: Option<i64>,
    /// Completion tokens
    pub completion_tokens: Option<i64>,
    /// Total tokens
    pub total_tokens: Option<i64>,
    /// Prompt tokens served from cache
    pub prompt_cached_tokens: Option<i64>,
    /// Prompt audio tokens
    pub prompt_audio_tokens: Option<i64>,
    /// Completion tokens spent on reasoning
    pub completion_reasoning_tokens: Option<i64>,
    /// Completion audio tokens
    pub completion_audio_tokens: Option<i64>,
    /// Accepted predicted-output tokens
    pub completion_accepted_prediction_tokens: Option<i64>,
    /// Rejected predicted-output tokens
    pub completion_rejected_prediction_tokens: Option<i64>,
    /// Request to last byte consumed, in milliseconds
    pub total_latency_ms: Option<f64>,
    /// Request to response headers, in milliseconds
    pub processing_time_ms: Option<f64>,
    /// Completion tokens per second of total latency
    pub tokens_per_second: Option<f64>,
    /// Size of the response body
    pub response_size_bytes: Option<i64>,
    /// Estimated cost in USD
    pub cost_usd: Option<f64>,

    // Rate limits
    /// Request limit reported by the API
    pub rate_limit_requests_limit: Option<i64>,
    /// Remaining requests reported by the API
    pub rate_limit_remaining: Option<i64>,
    /// Token limit reported by the API
    pub rate_limit_tokens_limit: Option<i64>,
    /// Remaining tokens reported by the API
    pub rate_limit_tokens_remaining: Option<i64>,

    // Outcome
    /// Whether the call succeeded
    pub success: bool,
    /// Error code (API error code or HTTP status)
    pub error_code: Option<String>,
    /// Error message or body
    pub error_message: Option<String>,
    /// Classified error category
    pub error_category: Option<String>,
    /// Retries performed by the tracer (always 0, retries are the client's job)
    pub retry_count: u32,

    // Bookkeeping
    /// Fraction of declared fields that are populated
    pub data_completeness_score: Option<f64>,
    /// Names of declared fields that are empty
    pub missing_fields: Vec<String>,
    /// Lifecycle status
    pub trace_status: TraceStatus,
    /// When the record was created
    pub trace_created_at: DateTime<Utc>,
    /// When the record was last updated
    pub trace_updated_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal status
    pub trace_completed_at: Option<DateTime<Utc>>,
}

impl TraceRecord {
    /// Create a pending trace for `session_id` with a fresh trace id
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), session_id)
    }

    /// Create a pending trace with an explicit id
    pub fn with_id(trace_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            session_id: session_id.into(),
            user_id: None,
            model_id: None,
            endpoint: None,
            api_version: None,
            request_timestamp: None,
            response_timestamp: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stream: None,
            stop_sequences: Vec::new(),
            logit_bias: None,
            seed: None,
            request_size_bytes: None,
            conversation: Vec::new(),
            images: Vec::new(),
            finish_reason: None,
            choice_index: None,
            response_id: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            prompt_cached_tokens: None,
            prompt_audio_tokens: None,
            completion_reasoning_tokens: None,
            completion_audio_tokens: None,
            completion_accepted_prediction_tokens: None,
            completion_rejected_prediction_tokens: None,
            total_latency_ms: None,
            processing_time_ms: None,
            tokens_per_second: None,
            response_size_bytes: None,
            cost_usd: None,
            rate_limit_requests_limit: None,
            rate_limit_remaining: None,
            rate_limit_tokens_limit: None,
            rate_limit_tokens_remaining: None,
            success: true,
            error_code: None,
            error_message: None,
            error_category: None,
            retry_count: 0,
            data_completeness_score: None,
            missing_fields: Vec::new(),
            trace_status: TraceStatus::Pending,
            trace_created_at: Utc::now(),
            trace_updated_at: None,
            trace_completed_at: None,
        }
    }

    /// Copy the request parameters into the record
    pub fn apply_request(&mut self, params: &RequestParams) {
        self.model_id = params.model.clone();
        self.temperature = params.temperature;
        self.max_tokens = params.max_tokens;
        self.top_p = params.top_p;
        self.frequency_penalty = params.frequency_penalty;
        self.presence_penalty = params.presence_penalty;
        self.seed = params.seed;
        self.stop_sequences = params.stop.clone();
        self.logit_bias = params.logit_bias.clone();
        self.stream = Some(params.stream);
    }

    /// Copy the parsed response into the record.
    ///
    /// Token counts default to zero when the response carried no usage, so a
    /// completed trace always has numeric counts.
    pub fn apply_response(&mut self, parsed: &ParsedResponse) {
        let usage = &parsed.usage;
        self.prompt_tokens = Some(usage.prompt_tokens);
        self.completion_tokens = Some(usage.completion_tokens);
        self.total_tokens = Some(usage.total_tokens);
        self.prompt_cached_tokens = usage.prompt_cached_tokens;
        self.prompt_audio_tokens = usage.prompt_audio_tokens;
        self.completion_reasoning_tokens = usage.completion_reasoning_tokens;
        self.completion_audio_tokens = usage.completion_audio_tokens;
        self.completion_accepted_prediction_tokens = usage.completion_accepted_prediction_tokens;
        self.completion_rejected_prediction_tokens = usage.completion_rejected_prediction_tokens;

        self.finish_reason = parsed.finish_reason.clone();
        self.response_id = parsed.response_id.clone();
        if parsed.assistant_content.is_some() {
            self.choice_index = Some(0);
        }

        self.apply_rate_limits(&parsed.rate_limits);
    }

    /// Record the rate-limit state reported with the response
    pub fn apply_rate_limits(&mut self, limits: &RateLimits) {
        self.rate_limit_requests_limit = limits.requests_limit;
        self.rate_limit_remaining = limits.requests_remaining;
        self.rate_limit_tokens_limit = limits.tokens_limit;
        self.rate_limit_tokens_remaining = limits.tokens_remaining;
    }

    /// Set total latency and derive throughput from completion tokens
    pub fn set_latency(&mut self, latency_ms: f64) {
        self.total_latency_ms = Some(latency_ms);
        self.tokens_per_second = match self.completion_tokens {
            Some(tokens) if tokens > 0 && latency_ms > 0.0 => {
                Some(tokens as f64 / (latency_ms / 1000.0))
            }
            _ => None,
        };
    }

    /// Record the final assistant token count on the last assistant turn
    pub fn populate_assistant_tokens(&mut self) {
        let Some(completion_tokens) = self.completion_tokens.filter(|t| *t > 0) else {
            return;
        };
        if let Some(message) = self.conversation.iter_mut().rev().find(|m| m.is_assistant()) {
            message.token_count = Some(completion_tokens);
        }
    }

    /// Recompute the completeness score and missing-field list
    pub fn update_completeness(&mut self) {
        let presence = self.field_presence();
        let total = presence.len();
        let populated = presence.iter().filter(|(_, present)| *present).count();

        self.data_completeness_score = Some(if total == 0 {
            0.0
        } else {
            populated as f64 / total as f64
        });
        self.missing_fields = presence
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name)
            .collect();
        self.trace_updated_at = Some(Utc::now());
    }

    /// Transition to `complete`
    pub fn mark_completed(&mut self) {
        if self.trace_status.is_terminal() {
            tracing::debug!(trace_id = %self.trace_id, status = %self.trace_status, "Ignoring completion of finished trace");
            return;
        }
        self.trace_status = TraceStatus::Complete;
        self.trace_completed_at = Some(Utc::now());
        self.update_completeness();
    }

    /// Transition to `error` with the given details
    pub fn mark_error(
        &mut self,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        error_category: Option<String>,
    ) {
        if self.trace_status.is_terminal() {
            tracing::debug!(trace_id = %self.trace_id, status = %self.trace_status, "Ignoring error on finished trace");
            return;
        }
        self.success = false;
        self.error_code = Some(error_code.into());
        self.error_message = Some(error_message.into());
        self.error_category = error_category;
        self.trace_status = TraceStatus::Error;
        self.trace_completed_at = Some(Utc::now());
        self.update_completeness();
    }

    /// Whether the record reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.trace_status.is_terminal()
    }

    /// Last assistant turn, if the reply was captured
    pub fn assistant_message(&self) -> Option<&Message> {
        self.conversation.iter().rev().find(|m| m.is_assistant())
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Declared fields with whether each one is populated
    fn field_presence(&self) -> Vec<(String, bool)> {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return Vec::new();
        };

        fields
            .into_iter()
            .filter(|(name, _)| !BOOKKEEPING_FIELDS.contains(&name.as_str()))
            .map(|(name, value)| {
                let present = match &value {
                    serde_json::Value::Null => false,
                    serde_json::Value::String(s) => !s.is_empty(),
                    serde_json::Value::Array(items) => !items.is_empty(),
                    serde_json::Value::Object(map) => !map.is_empty(),
                    _ => true,
                };
                (name, present)
            })
            .collect()
    }
}
