//! Session, user and running-statistics models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical grouping of traces sharing conversational context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub session_id: String,

    /// User the session belongs to
    pub user_id: Option<String>,

    /// Kind of session (`tracer` for sessions opened by the transport)
    pub session_type: String,

    /// When the first request of the session was made
    pub created_at: Option<DateTime<Utc>>,

    /// When the last trace of the session finished
    pub last_activity_at: Option<DateTime<Utc>>,

    /// When the session was closed
    pub ended_at: Option<DateTime<Utc>>,

    /// Number of traced requests
    pub total_requests: i64,

    /// Tokens used across the session
    pub total_tokens: i64,

    /// Cost accumulated across the session
    pub total_cost: f64,
}

impl Session {
    /// Create a session that has not seen any request yet
    pub fn new(session_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id,
            session_type: "tracer".to_string(),
            created_at: None,
            last_activity_at: None,
            ended_at: None,
            total_requests: 0,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }

    /// Stamp creation and activity on first use
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.last_activity_at = Some(now);
    }

    /// Whether the session was closed
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Wall-clock span of the session so far
    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.created_at?;
        let end = self.ended_at.or(self.last_activity_at)?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// A user a session can be attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier
    pub user_id: String,
    /// Display name
    pub username: Option<String>,
    /// Email address
    pub email: Option<String>,
    /// When the user was first registered
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a user, generating an id when none is given
    pub fn new(user_id: Option<String>, username: Option<String>, email: Option<String>) -> Self {
        Self {
            user_id: user_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            username,
            email,
            created_at: Utc::now(),
        }
    }
}

/// Running counters kept by a traced transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Requests handled
    pub total_requests: u64,
    /// Prompt tokens across completed traces
    pub total_prompt_tokens: u64,
    /// Completion tokens across completed traces
    pub total_completion_tokens: u64,
    /// Total tokens across completed traces
    pub total_tokens: u64,
    /// Requests that returned a 2xx/3xx response
    pub successful_requests: u64,
    /// Requests that failed at the HTTP or transport level
    pub failed_requests: u64,
}

impl TransportStats {
    /// Fraction of requests that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Snapshot of the current session and its counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub session_id: String,
    /// Session type
    pub session_type: String,
    /// User the session belongs to
    pub user_id: Option<String>,
    /// First request time
    pub created_at: Option<DateTime<Utc>>,
    /// Last completed trace time
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When the session was closed
    pub ended_at: Option<DateTime<Utc>>,
    /// Cost accumulated in this process
    pub total_cost: f64,
    /// Counters of the owning transport
    #[serde(flatten)]
    pub stats: TransportStats,
}
