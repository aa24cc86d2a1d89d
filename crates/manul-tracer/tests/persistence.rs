//! Traced calls written through the pipeline into SQLite

use manul_tracer::config::Config;
use manul_tracer::db::SqliteStore;
use manul_tracer::models::{Role, TraceFilter, TraceStatus};
use manul_tracer::transport::{Request, Transport, Url};
use manul_tracer::Tracer;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// 1x1 transparent PNG
const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

async fn mock_openai() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-p1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "A single pixel."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 90, "completion_tokens": 4, "total_tokens": 94}
        })))
        .mount(&server)
        .await;
    server
}

fn config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.database.url = format!("sqlite://{}", dir.path().join("traces.db").display());
    config.tracer.session_id = Some("persist-session".to_string());
    config.tracer.user_id = Some("user-1".to_string());
    config.tracer.email = Some("ada@example.com".to_string());
    config
}

fn request(server: &MockServer, messages: serde_json::Value) -> Request {
    let url = Url::parse(&format!("{}/v1/chat/completions", server.uri())).unwrap();
    Request::post_json(url, &json!({"model": "gpt-4o", "messages": messages})).unwrap()
}

#[tokio::test]
async fn test_traces_survive_close_and_reopen() {
    let server = mock_openai().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let tracer = Tracer::open(&config).await.unwrap();
    let image = json!([
        {"type": "text", "text": "What is this?"},
        {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{PIXEL_PNG}")}}
    ]);
    let first = tracer
        .handle_request(request(&server, json!([{"role": "user", "content": image}])))
        .await
        .unwrap();
    first.bytes().await.unwrap();

    let second = tracer
        .handle_request(request(
            &server,
            json!([
                {"role": "user", "content": image},
                {"role": "assistant", "content": "A single pixel."},
                {"role": "user", "content": "Thanks"}
            ]),
        ))
        .await
        .unwrap();
    second.bytes().await.unwrap();

    let session = tracer.close().await.unwrap();
    assert!(session.ended_at.is_some());

    let store = SqliteStore::connect(&config.database).await.unwrap();
    let listed = store
        .list_traces(&TraceFilter {
            session_id: Some("persist-session".to_string()),
            ..TraceFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|t| t.trace_status == TraceStatus::Complete));
    assert!(listed.iter().all(|t| t.user_id.as_deref() == Some("user-1")));

    let longest = listed.iter().max_by_key(|t| t.conversation_length).unwrap();
    assert_eq!(longest.conversation_length, 4);

    let trace = store.get_trace(&longest.trace_id).await.unwrap().unwrap();
    let roles: Vec<Role> = trace.conversation.iter().map(|m| m.role.clone()).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    assert!(trace.conversation[0].has_images);
    assert_eq!(trace.images.len(), 1);
    assert_eq!(trace.images[0].format, "PNG");
    assert_eq!(trace.images[0].width, Some(1));

    // both calls share the first two turns
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(messages, 4);
    let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(images, 1);

    let stored = store.get_session("persist-session").await.unwrap().unwrap();
    assert_eq!(stored.user_id.as_deref(), Some("user-1"));
    assert_eq!(stored.total_requests, 2);
    assert_eq!(stored.total_tokens, 188);
    assert!(stored.total_cost > 0.0);
    assert!(!stored.is_active());

    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.total_traces, 2);
    assert_eq!(stats.active_sessions, 0);
}

#[tokio::test]
async fn test_auto_save_off_writes_nothing() {
    let server = mock_openai().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.tracer.auto_save = false;

    let tracer = Tracer::open(&config).await.unwrap();
    let response = tracer
        .handle_request(request(&server, json!([{"role": "user", "content": "hi"}])))
        .await
        .unwrap();
    response.bytes().await.unwrap();
    assert_eq!(tracer.stats().total_requests, 1);
    tracer.close().await.unwrap();

    let store = SqliteStore::connect(&config.database).await.unwrap();
    assert_eq!(store.statistics().await.unwrap().total_traces, 0);
    assert!(store.get_session("persist-session").await.unwrap().is_none());
}
