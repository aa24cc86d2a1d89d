//! Traced calls against a mock OpenAI server

use std::sync::Arc;

use manul_tracer::collector::MemorySink;
use manul_tracer::models::{Role, TraceStatus};
use manul_tracer::transport::{
    HeaderValue, ReqwestTransport, Request, TracedTransport, TracerOptions, Transport,
    TransportErrorKind, Url,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn traced() -> (TracedTransport<ReqwestTransport>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let options = TracerOptions {
        session_id: Some("e2e-session".to_string()),
        ..TracerOptions::default()
    };
    let transport = TracedTransport::new(
        ReqwestTransport::with_client(reqwest::Client::new()),
        options,
        sink.clone(),
    );
    (transport, sink)
}

fn chat_request(server: &MockServer, payload: &Value) -> Request {
    let url = Url::parse(&format!("{}/v1/chat/completions", server.uri())).unwrap();
    Request::post_json(url, payload)
        .unwrap()
        .with_header(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static("OpenAI/Python 1.3.0"),
        )
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-abc123",
        "object": "chat.completion",
        "model": "gpt-4o-mini-2024-07-18",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 21,
            "completion_tokens": 2,
            "total_tokens": 23,
            "prompt_tokens_details": {"cached_tokens": 0}
        }
    })
}

#[tokio::test]
async fn test_two_message_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("content-type", "application/json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-limit-requests", "500")
                .insert_header("x-ratelimit-remaining-requests", "499")
                .set_body_json(completion("Hello!")),
        )
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let payload = json!({
        "model": "gpt-4o-mini",
        "temperature": 0.7,
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Say hello"}
        ]
    });

    let response = transport
        .handle_request(chat_request(&server, &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, completion("Hello!"));

    let traces = sink.traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.trace_status, TraceStatus::Complete);
    assert!(trace.success);
    assert_eq!(trace.session_id, "e2e-session");
    assert_eq!(trace.model_id.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(trace.api_version.as_deref(), Some("1.3.0"));
    assert_eq!(trace.temperature, Some(0.7));
    assert_eq!(trace.stream, Some(false));
    assert_eq!(trace.finish_reason.as_deref(), Some("stop"));
    assert_eq!(trace.response_id.as_deref(), Some("chatcmpl-abc123"));
    assert_eq!(trace.total_tokens, Some(23));
    assert_eq!(trace.rate_limit_requests_limit, Some(500));
    assert_eq!(trace.rate_limit_remaining, Some(499));
    assert!(trace.cost_usd.unwrap() > 0.0);
    assert!(trace.total_latency_ms.unwrap() >= 0.0);

    let roles: Vec<Role> = trace.conversation.iter().map(|m| m.role.clone()).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    let reply = trace.assistant_message().unwrap();
    assert_eq!(reply.text(), "Hello!");
    assert_eq!(reply.token_count, Some(2));

    let stats = transport.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.total_tokens, 23);
    assert_eq!(sink.session_updates(), vec!["e2e-session".to_string()]);
}

#[tokio::test]
async fn test_follow_up_call_reuses_message_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello!")))
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let first = json!({"model": "gpt-4o-mini", "messages": [
        {"role": "user", "content": "Say hello"}
    ]});
    let second = json!({"model": "gpt-4o-mini", "messages": [
        {"role": "user", "content": "Say hello"},
        {"role": "assistant", "content": "Hello!"},
        {"role": "user", "content": "Again"}
    ]});

    for payload in [&first, &second] {
        let response = transport.handle_request(chat_request(&server, payload)).await.unwrap();
        response.bytes().await.unwrap();
    }

    let traces = sink.traces();
    let first_ids: Vec<&str> = traces[0].conversation.iter().map(|m| m.message_id.as_str()).collect();
    let second_ids: Vec<&str> = traces[1].conversation.iter().map(|m| m.message_id.as_str()).collect();

    // user turn and the captured reply are the same rows the second call resent
    assert_eq!(first_ids[..2], second_ids[..2]);
    assert_ne!(second_ids[2], second_ids[3]);
    assert_eq!(second_ids.len(), 4);
}

#[tokio::test]
async fn test_streamed_completion() {
    let server = MockServer::start().await;
    let sse = [
        json!({"id": "chatcmpl-s1", "model": "gpt-4o-mini", "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
        json!({"id": "chatcmpl-s1", "choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
        json!({"id": "chatcmpl-s1", "choices": [{"index": 0, "delta": {"content": "lo!"}, "finish_reason": "stop"}]}),
        json!({"id": "chatcmpl-s1", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}}),
    ]
    .iter()
    .map(|chunk| format!("data: {chunk}\n\n"))
    .collect::<String>()
        + "data: [DONE]\n\n";

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse.clone(), "text/event-stream"))
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let payload = json!({
        "model": "gpt-4o-mini",
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": [{"role": "user", "content": "Say hello"}]
    });

    let mut response = transport
        .handle_request(chat_request(&server, &payload))
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        assert!(sink.is_empty(), "trace must not be finalized mid-stream");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, sse.as_bytes());

    let trace = &sink.traces()[0];
    assert_eq!(trace.trace_status, TraceStatus::Complete);
    assert_eq!(trace.stream, Some(true));
    assert_eq!(trace.assistant_message().unwrap().text(), "Hello!");
    assert_eq!(trace.finish_reason.as_deref(), Some("stop"));
    assert_eq!(trace.total_tokens, Some(11));
    assert_eq!(trace.response_size_bytes, Some(sse.len() as i64));
}

#[tokio::test]
async fn test_rate_limited_call() {
    let server = MockServer::start().await;
    let error = json!({"error": {
        "message": "Rate limit reached for gpt-4o-mini",
        "type": "requests",
        "code": "rate_limit_exceeded"
    }});
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-ratelimit-remaining-requests", "0")
                .set_body_json(error.clone()),
        )
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let payload = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]});
    let response = transport
        .handle_request(chat_request(&server, &payload))
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    assert_eq!(response.json::<Value>().await.unwrap(), error);

    let trace = &sink.traces()[0];
    assert_eq!(trace.trace_status, TraceStatus::Error);
    assert!(!trace.success);
    assert_eq!(trace.error_category.as_deref(), Some("RateLimitError"));
    assert_eq!(trace.error_code.as_deref(), Some("rate_limit_exceeded"));
    assert_eq!(trace.rate_limit_remaining, Some(0));

    let stats = transport.stats();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.successful_requests, 0);
}

#[tokio::test]
async fn test_server_error_without_code_uses_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let payload = json!({"model": "gpt-4o-mini", "messages": []});
    let response = transport
        .handle_request(chat_request(&server, &payload))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "upstream unavailable");

    let trace = &sink.traces()[0];
    assert_eq!(trace.error_category.as_deref(), Some("ServerError"));
    assert_eq!(trace.error_code.as_deref(), Some("503"));
    assert_eq!(trace.error_message.as_deref(), Some("upstream unavailable"));
}

#[tokio::test]
async fn test_connection_refused() {
    let (transport, sink) = traced();
    let url = Url::parse("http://127.0.0.1:1/v1/chat/completions").unwrap();
    let request = Request::post_json(
        url,
        &json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .unwrap();

    let err = transport.handle_request(request).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Connect);

    let trace = &sink.traces()[0];
    assert_eq!(trace.trace_status, TraceStatus::Error);
    assert_eq!(trace.error_category.as_deref(), Some("ConnectError"));
    assert_eq!(trace.conversation.len(), 1);
    assert_eq!(transport.stats().failed_requests, 1);
}

#[tokio::test]
async fn test_malformed_request_body_still_reaches_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let (transport, sink) = traced();
    let url = Url::parse(&format!("{}/v1/chat/completions", server.uri())).unwrap();
    let request = Request::new(reqwest::Method::POST, url).with_body("{not json");

    let response = transport.handle_request(request).await.unwrap();
    response.bytes().await.unwrap();

    let trace = &sink.traces()[0];
    assert_eq!(trace.trace_status, TraceStatus::Complete);
    assert!(trace.model_id.is_none());
    assert_eq!(trace.conversation.len(), 1);
    assert!(trace.conversation[0].is_assistant());
}
