//! Tracing decorator over any [`Transport`]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info_span, warn, Instrument, Span};

use super::capture::{CapturingBody, PendingTrace};
use super::{BufferedBody, HeaderMap, Request, Response, ResponseBody, Transport, TransportError};
use crate::classify::{classify_status, classify_transport_error, http_error_code, ErrorCategory};
use crate::collector::{CostCalculator, TraceSink};
use crate::config::TracerConfig;
use crate::error::Result;
use crate::identity::{content_hash, MessageIdentityResolver};
use crate::models::{
    Message, MessageContent, Role, Session, SessionInfo, TraceRecord, TransportStats,
};
use crate::parser::{parse_request, ParsedResponse, RateLimits};

/// Options of a [`TracedTransport`]
#[derive(Debug, Clone)]
pub struct TracerOptions {
    /// Session id; generated when absent
    pub session_id: Option<String>,
    /// User the session belongs to
    pub user_id: Option<String>,
    /// Session type recorded with the session
    pub session_type: String,
    /// Whether finished traces are handed to the sink
    pub auto_save: bool,
    /// Parent span of every call span
    pub span: Span,
    /// Cost estimation
    pub costs: CostCalculator,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self::from(&TracerConfig::default())
    }
}

impl From<&TracerConfig> for TracerOptions {
    fn from(config: &TracerConfig) -> Self {
        Self {
            session_id: config.session_id.clone(),
            user_id: config.user_id.clone(),
            session_type: config.session_type.clone(),
            auto_save: config.auto_save,
            span: Span::none(),
            costs: CostCalculator::new(),
        }
    }
}

impl TracerOptions {
    /// Record call spans under `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Use a custom price list
    #[must_use]
    pub fn with_cost_calculator(mut self, costs: CostCalculator) -> Self {
        self.costs = costs;
        self
    }
}

struct SessionState {
    session: Session,
    stats: TransportStats,
    identities: MessageIdentityResolver,
}

/// State shared by a transport, its clones and the bodies it hands out
pub(crate) struct Shared {
    state: Mutex<SessionState>,
    sink: Arc<dyn TraceSink>,
    auto_save: bool,
    costs: CostCalculator,
    span: Span,
}

impl Shared {
    /// Open a pending trace for `request`
    fn begin(&self, request: &Request) -> TraceRecord {
        let now = Utc::now();
        let parsed = parse_request(&request.body);

        let mut state = self.state.lock();
        state.stats.total_requests += 1;
        state.session.total_requests += 1;
        state.session.touch(now);

        let mut trace = TraceRecord::new(state.session.session_id.clone());
        trace.user_id = state.session.user_id.clone();
        trace.request_timestamp = Some(now);
        trace.endpoint = Some(request.url.to_string());
        trace.api_version = client_version(&request.headers);
        trace.request_size_bytes = Some(request.body.len() as i64);
        trace.apply_request(&parsed.params);
        trace.images = parsed.images;

        let trace_id = trace.trace_id.clone();
        trace.conversation = parsed
            .messages
            .into_iter()
            .enumerate()
            .map(|(position, turn)| {
                let message_id =
                    state
                        .identities
                        .resolve(&turn.role, turn.content.as_ref(), position);
                Message {
                    message_id,
                    trace_id: Some(trace_id.clone()),
                    content_hash: Some(content_hash(turn.content.as_ref())),
                    role: turn.role,
                    content: turn.content,
                    has_images: turn.has_images,
                    message_order: Some(position as i64),
                    message_timestamp: Some(now),
                    token_count: None,
                }
            })
            .collect();

        trace
    }

    /// Merge a parsed response into the trace and mark it complete
    pub(crate) fn complete(
        &self,
        trace: &mut TraceRecord,
        parsed: &ParsedResponse,
        latency_ms: f64,
    ) -> Result<()> {
        trace.apply_response(parsed);

        {
            let mut state = self.state.lock();
            state.stats.successful_requests += 1;
            let reply = parsed.assistant_content.as_deref().filter(|t| !t.is_empty());
            if let Some(text) = reply {
                let position = trace.conversation.len();
                let content = MessageContent::Text(text.to_string());
                let message_id = state
                    .identities
                    .resolve(&Role::Assistant, Some(&content), position);
                let hash = content_hash(Some(&content));
                trace.conversation.push(Message {
                    message_id,
                    trace_id: Some(trace.trace_id.clone()),
                    role: Role::Assistant,
                    content: Some(content),
                    content_hash: Some(hash),
                    has_images: false,
                    message_order: Some(position as i64),
                    message_timestamp: Some(Utc::now()),
                    token_count: None,
                });
                // only the reply minted by this call carries its completion tokens
                trace.populate_assistant_tokens();
            }
            trace.cost_usd = self.costs.cost_of(trace);
            trace.set_latency(latency_ms);

            let stats = &mut state.stats;
            stats.total_prompt_tokens += token_count(trace.prompt_tokens);
            stats.total_completion_tokens += token_count(trace.completion_tokens);
            stats.total_tokens += token_count(trace.total_tokens);

            let session = &mut state.session;
            session.total_tokens += trace.total_tokens.unwrap_or(0);
            session.total_cost += trace.cost_usd.unwrap_or(0.0);
            session.touch(Utc::now());
        }

        trace.mark_completed();

        metrics::counter!("manul_requests_total", "outcome" => "complete").increment(1);
        metrics::counter!("manul_tokens_total", "kind" => "prompt")
            .increment(token_count(trace.prompt_tokens));
        metrics::counter!("manul_tokens_total", "kind" => "completion")
            .increment(token_count(trace.completion_tokens));
        metrics::histogram!("manul_request_latency_ms").record(latency_ms);

        debug!(
            trace_id = %trace.trace_id,
            model = trace.model_id.as_deref().unwrap_or("unknown"),
            total_tokens = trace.total_tokens.unwrap_or(0),
            latency_ms,
            streamed = parsed.streamed,
            "Call traced"
        );

        self.notify(trace)
    }

    /// Mark the trace failed
    pub(crate) fn fail(
        &self,
        trace: &mut TraceRecord,
        code: &str,
        message: String,
        category: ErrorCategory,
        latency_ms: f64,
    ) -> Result<()> {
        trace.set_latency(latency_ms);
        {
            let mut state = self.state.lock();
            state.stats.failed_requests += 1;
            state.session.touch(Utc::now());
        }
        trace.mark_error(code, message, Some(category.to_string()));

        metrics::counter!("manul_requests_total", "outcome" => "error").increment(1);
        metrics::histogram!("manul_request_latency_ms").record(latency_ms);
        debug!(
            trace_id = %trace.trace_id,
            error_code = code,
            category = %category,
            "Call failed"
        );

        self.notify(trace)
    }

    fn notify(&self, trace: &TraceRecord) -> Result<()> {
        if !self.auto_save {
            return Ok(());
        }
        self.sink.persist(trace)?;
        self.sink.update_session_activity(&trace.session_id)
    }

    /// Log a failure of trace bookkeeping without letting it escape
    pub(crate) fn contain(&self, outcome: Result<()>, trace_id: &str) {
        if let Err(err) = outcome {
            metrics::counter!("manul_sink_errors_total").increment(1);
            warn!(trace_id, error = %err, "Failed to record trace");
        }
    }

    async fn http_failed(
        &self,
        mut trace: TraceRecord,
        response: Response,
        started: Instant,
    ) -> Response {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let (body, error_body) = match response.bytes().await {
            Ok(bytes) => {
                trace.response_size_bytes = Some(bytes.len() as i64);
                let text = String::from_utf8_lossy(&bytes).into_owned();
                (BufferedBody::new(bytes), text)
            }
            Err(err) => {
                let text = format!("failed to read error response: {err}");
                (BufferedBody::failed(err), text)
            }
        };

        trace.apply_rate_limits(&RateLimits::from_headers(&headers));
        let category = classify_status(status, &error_body);
        let code = http_error_code(status, &error_body);

        let outcome = self.fail(&mut trace, &code, error_body, category, elapsed_ms(started));
        self.contain(outcome, &trace.trace_id);

        Response::new(status, headers, url, body)
    }

    fn transport_failed(&self, mut trace: TraceRecord, err: &TransportError, started: Instant) {
        let category = classify_transport_error(err);
        let outcome = self.fail(
            &mut trace,
            err.kind().name(),
            err.to_string(),
            category,
            elapsed_ms(started),
        );
        self.contain(outcome, &trace.trace_id);
    }
}

/// Transport decorator recording one trace per call.
///
/// The wrapped transport sees the request unmodified and the caller gets the
/// same status, headers, bytes and errors it would have gotten without
/// tracing. Clones share the session, counters and identity cache.
pub struct TracedTransport<T> {
    inner: Arc<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for TracedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> TracedTransport<T> {
    /// Wrap `inner`, sending finished traces to `sink`
    pub fn new(inner: T, options: TracerOptions, sink: Arc<dyn TraceSink>) -> Self {
        let TracerOptions {
            session_id,
            user_id,
            session_type,
            auto_save,
            span,
            costs,
        } = options;
        let mut session = Session::new(session_id, user_id);
        session.session_type = session_type;

        debug!(
            parent: &span,
            session_id = %session.session_id,
            auto_save,
            "Traced transport created"
        );

        Self {
            inner: Arc::new(inner),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    session,
                    stats: TransportStats::default(),
                    identities: MessageIdentityResolver::new(),
                }),
                sink,
                auto_save,
                costs,
                span,
            }),
        }
    }

    /// The wrapped transport
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Current session id
    pub fn session_id(&self) -> String {
        self.shared.state.lock().session.session_id.clone()
    }

    /// Snapshot of the running counters.
    ///
    /// A call counts as successful or failed once its trace is finalized, so
    /// a streamed response still being read is only in `total_requests`.
    pub fn stats(&self) -> TransportStats {
        self.shared.state.lock().stats
    }

    /// Zero the running counters; the session and identities are kept
    pub fn reset_stats(&self) {
        self.shared.state.lock().stats = TransportStats::default();
    }

    /// Session details with the running counters
    pub fn session_info(&self) -> SessionInfo {
        let state = self.shared.state.lock();
        let session = &state.session;
        SessionInfo {
            session_id: session.session_id.clone(),
            session_type: session.session_type.clone(),
            user_id: session.user_id.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            ended_at: session.ended_at,
            total_cost: session.total_cost,
            stats: state.stats,
        }
    }

    /// Close the session and return its final state
    pub fn end_session(&self) -> Session {
        let now = Utc::now();
        let session = {
            let mut state = self.shared.state.lock();
            if state.session.ended_at.is_none() {
                state.session.ended_at = Some(now);
            }
            state.session.clone()
        };

        if self.shared.auto_save {
            if let Err(err) = self.shared.sink.end_session(&session.session_id, now) {
                metrics::counter!("manul_sink_errors_total").increment(1);
                warn!(parent: &self.shared.span, session_id = %session.session_id, error = %err, "Failed to end session");
            }
        }
        session
    }
}

#[async_trait]
impl<T: Transport> Transport for TracedTransport<T> {
    async fn handle_request(
        &self,
        request: Request,
    ) -> std::result::Result<Response, TransportError> {
        let started = Instant::now();
        let mut trace = self.shared.begin(&request);
        let span = info_span!(
            parent: &self.shared.span,
            "llm_call",
            trace_id = %trace.trace_id,
            model = trace.model_id.as_deref().unwrap_or("unknown"),
        );

        let response = match self
            .inner
            .handle_request(request)
            .instrument(span.clone())
            .await
        {
            Ok(response) => response,
            Err(err) => {
                span.in_scope(|| self.shared.transport_failed(trace, &err, started));
                return Err(err);
            }
        };

        trace.response_timestamp = Some(Utc::now());
        trace.processing_time_ms = Some(elapsed_ms(started));

        if response.status().as_u16() >= 400 {
            return Ok(self
                .shared
                .http_failed(trace, response, started)
                .instrument(span)
                .await);
        }

        let pending = PendingTrace {
            trace,
            shared: Arc::clone(&self.shared),
            status: response.status(),
            headers: response.headers().clone(),
            started,
            span,
        };
        Ok(response.map_body(|body| {
            Box::new(CapturingBody::new(body, pending)) as Box<dyn ResponseBody>
        }))
    }
}

fn client_version(headers: &HeaderMap) -> Option<String> {
    let user_agent = headers.get(reqwest::header::USER_AGENT)?.to_str().ok()?;
    user_agent
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(String::from)
}

fn token_count(tokens: Option<i64>) -> u64 {
    tokens.and_then(|t| u64::try_from(t).ok()).unwrap_or(0)
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
