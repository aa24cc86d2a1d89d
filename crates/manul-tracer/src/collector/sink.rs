//! Persistence port of the traced transport

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::TraceRecord;

/// Receiver of finished traces.
///
/// Calls happen inline on the request path, so implementations must not
/// block; anything slow belongs behind a queue (see [`super::Pipeline`]).
/// Errors are logged by the caller and never reach the traced code.
pub trait TraceSink: Send + Sync {
    /// Create or update the stored trace with the same `trace_id`
    fn persist(&self, trace: &TraceRecord) -> Result<()>;

    /// Refresh the activity timestamp and totals of a session
    fn update_session_activity(&self, session_id: &str) -> Result<()>;

    /// Close a session
    fn end_session(&self, _session_id: &str, _ended_at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn persist(&self, _trace: &TraceRecord) -> Result<()> {
        Ok(())
    }

    fn update_session_activity(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Sink keeping traces in memory, latest version per trace id
#[derive(Debug, Default)]
pub struct MemorySink {
    traces: Mutex<Vec<TraceRecord>>,
    session_updates: Mutex<Vec<String>>,
    ended_sessions: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored traces in first-persisted order
    pub fn traces(&self) -> Vec<TraceRecord> {
        self.traces.lock().clone()
    }

    /// Stored trace by id
    pub fn get(&self, trace_id: &str) -> Option<TraceRecord> {
        self.traces
            .lock()
            .iter()
            .find(|trace| trace.trace_id == trace_id)
            .cloned()
    }

    /// Number of stored traces
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    /// Whether no trace was stored
    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }

    /// Session ids passed to `update_session_activity`, in call order
    pub fn session_updates(&self) -> Vec<String> {
        self.session_updates.lock().clone()
    }

    /// Session ids passed to `end_session`
    pub fn ended_sessions(&self) -> Vec<String> {
        self.ended_sessions.lock().clone()
    }
}

impl TraceSink for MemorySink {
    fn persist(&self, trace: &TraceRecord) -> Result<()> {
        let mut traces = self.traces.lock();
        match traces.iter_mut().find(|t| t.trace_id == trace.trace_id) {
            Some(existing) => *existing = trace.clone(),
            None => traces.push(trace.clone()),
        }
        Ok(())
    }

    fn update_session_activity(&self, session_id: &str) -> Result<()> {
        self.session_updates.lock().push(session_id.to_string());
        Ok(())
    }

    fn end_session(&self, session_id: &str, _ended_at: DateTime<Utc>) -> Result<()> {
        self.ended_sessions.lock().push(session_id.to_string());
        Ok(())
    }
}
