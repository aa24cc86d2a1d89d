//! Query and response types shared between the store and the CLI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TraceStatus;

/// Filter for listing traces
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFilter {
    /// Filter by session
    pub session_id: Option<String>,

    /// Filter by user
    pub user_id: Option<String>,

    /// Filter by model
    pub model_id: Option<String>,

    /// Filter by lifecycle status
    pub status: Option<TraceStatus>,

    /// Filter by outcome
    pub success: Option<bool>,

    /// Only traces requested at or after this time
    pub since: Option<DateTime<Utc>>,

    /// Maximum number of results
    pub limit: Option<i64>,

    /// Offset for pagination
    pub offset: Option<i64>,
}

/// One row of a trace listing
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    /// Trace identifier
    pub trace_id: String,
    /// Owning session
    pub session_id: String,
    /// User, when known
    pub user_id: Option<String>,
    /// Requested model
    pub model_id: Option<String>,
    /// Lifecycle status
    pub trace_status: TraceStatus,
    /// Whether the call succeeded
    pub success: bool,
    /// Total tokens, zero when unreported
    pub total_tokens: i64,
    /// End-to-end latency
    pub total_latency_ms: Option<f64>,
    /// Estimated cost
    pub cost_usd: Option<f64>,
    /// Error category for failed calls
    pub error_category: Option<String>,
    /// When the request was sent
    pub request_timestamp: Option<DateTime<Utc>>,
    /// Number of linked messages
    pub conversation_length: i64,
}

/// Store-wide aggregates
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatistics {
    /// All traces
    pub total_traces: i64,
    /// Traces that succeeded
    pub successful_traces: i64,
    /// Traces that failed
    pub failed_traces: i64,
    /// All sessions
    pub total_sessions: i64,
    /// Sessions not yet ended
    pub active_sessions: i64,
    /// Prompt tokens across traces
    pub total_prompt_tokens: i64,
    /// Completion tokens across traces
    pub total_completion_tokens: i64,
    /// Total tokens across traces
    pub total_tokens: i64,
    /// Summed cost in USD
    pub total_cost: f64,
    /// Mean latency
    pub avg_latency_ms: Option<f64>,
    /// Distinct models seen
    pub unique_models: i64,
}

impl StoreStatistics {
    /// Percentage of traces that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_traces == 0 {
            0.0
        } else {
            self.successful_traces as f64 / self.total_traces as f64 * 100.0
        }
    }
}

/// Token and cost usage for one model
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    /// Model name
    pub model_id: String,
    /// Number of traces
    pub request_count: i64,
    /// Prompt tokens
    pub prompt_tokens: i64,
    /// Completion tokens
    pub completion_tokens: i64,
    /// Total tokens
    pub total_tokens: i64,
    /// Summed cost in USD
    pub total_cost: f64,
    /// Mean latency
    pub avg_latency_ms: Option<f64>,
}

/// Latency distribution over successful traces
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStatistics {
    /// Number of samples
    pub count: i64,
    /// Fastest call
    pub min_ms: Option<f64>,
    /// Slowest call
    pub max_ms: Option<f64>,
    /// Mean
    pub avg_ms: Option<f64>,
    /// Median
    pub p50_ms: Option<f64>,
    /// 95th percentile
    pub p95_ms: Option<f64>,
}
