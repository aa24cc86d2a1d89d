//! Body decorator that records what the caller reads

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, Span};

use super::traced::{elapsed_ms, Shared};
use super::{HeaderMap, ResponseBody, StatusCode, TransportError};
use crate::classify::classify_transport_error;
use crate::error::Result;
use crate::models::TraceRecord;
use crate::parser::parse_response;

/// Trace waiting for its response body
pub(crate) struct PendingTrace {
    pub(crate) trace: TraceRecord,
    pub(crate) shared: Arc<Shared>,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) started: Instant,
    pub(crate) span: Span,
}

impl PendingTrace {
    fn finish(self, captured: &[u8]) {
        let _entered = self.span.enter();
        let mut trace = self.trace;
        trace.response_size_bytes = Some(captured.len() as i64);

        let streaming = trace.stream.unwrap_or(false);
        let parsed = parse_response(self.status, &self.headers, captured, streaming);
        let outcome: Result<()> = self
            .shared
            .complete(&mut trace, &parsed, elapsed_ms(self.started));
        self.shared.contain(outcome, &trace.trace_id);
    }

    fn abort(self, err: &TransportError) {
        let _entered = self.span.enter();
        let mut trace = self.trace;
        let outcome = self.shared.fail(
            &mut trace,
            err.kind().name(),
            err.to_string(),
            classify_transport_error(err),
            elapsed_ms(self.started),
        );
        self.shared.contain(outcome, &trace.trace_id);
    }
}

/// Response body that passes bytes through unchanged while keeping a copy.
///
/// The trace is finalized exactly once: when a bulk read returns a non-empty
/// body, when chunked reading reaches the end, or when the body is dropped
/// before either happened. A read error fails the trace and is returned to
/// the caller as is.
pub struct CapturingBody {
    inner: Box<dyn ResponseBody>,
    captured: BytesMut,
    pending: Option<PendingTrace>,
}

impl CapturingBody {
    pub(crate) fn new(inner: Box<dyn ResponseBody>, pending: PendingTrace) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            pending: Some(pending),
        }
    }

    /// Bytes captured so far
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Whether the trace was already finalized
    pub fn is_finalized(&self) -> bool {
        self.pending.is_none()
    }

    fn capture(&mut self, bytes: &[u8]) {
        if self.pending.is_some() {
            self.captured.extend_from_slice(bytes);
        }
    }

    fn finalize(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.finish(&self.captured);
        }
    }

    fn fail(&mut self, err: &TransportError) {
        if let Some(pending) = self.pending.take() {
            pending.abort(err);
        }
    }
}

#[async_trait]
impl ResponseBody for CapturingBody {
    async fn read_all(&mut self) -> std::result::Result<Bytes, TransportError> {
        match self.inner.read_all().await {
            Ok(content) => {
                self.capture(&content);
                if !content.is_empty() {
                    self.finalize();
                }
                Ok(content)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, TransportError> {
        match self.inner.next_chunk().await {
            Ok(Some(chunk)) => {
                self.capture(&chunk);
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finalize();
                Ok(None)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }
}

impl Drop for CapturingBody {
    fn drop(&mut self) {
        if self.pending.is_some() {
            debug!(
                captured_bytes = self.captured.len(),
                "Response dropped before it was fully read"
            );
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MemorySink;
    use crate::models::TraceStatus;
    use crate::transport::{
        BufferedBody, ChunkedBody, Request, Response, Transport, TransportErrorKind,
        TracedTransport, TracerOptions, Url,
    };
    use serde_json::json;

    const REPLY: &str = r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;

    /// Transport handing out whatever body the test built
    struct OneShot(parking_lot::Mutex<Option<Box<dyn ResponseBody>>>);

    #[async_trait]
    impl Transport for OneShot {
        async fn handle_request(
            &self,
            request: Request,
        ) -> std::result::Result<Response, TransportError> {
            let body = self.0.lock().take().unwrap();
            Ok(Response::new(StatusCode::OK, HeaderMap::new(), request.url, BoxedBody(body)))
        }
    }

    struct BoxedBody(Box<dyn ResponseBody>);

    #[async_trait]
    impl ResponseBody for BoxedBody {
        async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, TransportError> {
            self.0.next_chunk().await
        }
    }

    async fn traced_response(
        body: impl ResponseBody + 'static,
    ) -> (Response, TracedTransport<OneShot>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let body: Box<dyn ResponseBody> = Box::new(body);
        let inner = OneShot(parking_lot::Mutex::new(Some(body)));
        let transport = TracedTransport::new(inner, TracerOptions::default(), sink.clone());
        let url = Url::parse("https://api.openai.com/v1/chat/completions").unwrap();
        let request = Request::post_json(url, &json!({"model": "gpt-4o", "messages": []})).unwrap();
        let response = transport.handle_request(request).await.unwrap();
        (response, transport, sink)
    }

    async fn respond_with(body: impl ResponseBody + 'static) -> (Response, Arc<MemorySink>) {
        let (response, _, sink) = traced_response(body).await;
        (response, sink)
    }

    #[tokio::test]
    async fn test_bulk_read_finalizes_once() {
        let body = BufferedBody::new(Bytes::from_static(REPLY.as_bytes()));
        let (response, sink) = respond_with(body).await;
        let body = response.bytes().await.unwrap();

        assert_eq!(&body[..], REPLY.as_bytes());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.session_updates().len(), 1);
        assert_eq!(sink.traces()[0].trace_status, TraceStatus::Complete);
        assert_eq!(sink.traces()[0].response_size_bytes, Some(REPLY.len() as i64));
    }

    #[tokio::test]
    async fn test_chunked_read_finalizes_at_end_only() {
        let chunks = REPLY.as_bytes().chunks(16).map(Bytes::copy_from_slice);
        let (mut response, sink) = respond_with(ChunkedBody::new(chunks)).await;

        assert!(response.chunk().await.unwrap().is_some());
        assert!(sink.is_empty());

        while response.chunk().await.unwrap().is_some() {}
        assert_eq!(sink.len(), 1);

        // reading past the end does not notify again
        assert!(response.chunk().await.unwrap().is_none());
        drop(response);
        assert_eq!(sink.session_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_finalizes_partial_body() {
        let chunks = vec![
            Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n"),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ];
        let (mut response, sink) = respond_with(ChunkedBody::new(chunks)).await;

        response.chunk().await.unwrap();
        drop(response);

        let trace = &sink.traces()[0];
        assert_eq!(trace.trace_status, TraceStatus::Complete);
        assert_eq!(trace.assistant_message().unwrap().text(), "par");
    }

    #[tokio::test]
    async fn test_read_error_fails_trace_and_reaches_caller() {
        let err = TransportError::new(TransportErrorKind::Body, "connection reset");
        let (response, transport, sink) = traced_response(BufferedBody::failed(err)).await;

        let err = response.bytes().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Body);

        let trace = &sink.traces()[0];
        assert_eq!(trace.trace_status, TraceStatus::Error);
        assert_eq!(trace.error_category.as_deref(), Some("BodyError"));

        // outcome counters follow the recorded status, not the response headers
        let stats = transport.stats();
        assert_eq!(stats.successful_requests, 0);
        assert_eq!(stats.failed_requests, 1);
    }
}
