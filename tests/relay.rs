//! Integration tests for the HTTP surface: /health and the /v1 relay.
//!
//! Requests go through the full axum router with `oneshot`; upstreams are
//! wiremock servers registered as `custom` channels.

use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate::channel::{ChannelSpec, ProviderType};
use relaygate::proxy::{
    create_router, AppState, ATTEMPTS_HEADER, CHANNEL_HEADER, RELAY_GROUP_HEADER,
    REQUEST_ID_HEADER,
};
use relaygate::relay::Dispatcher;
use relaygate::storage::{init_memory_pool, ChannelStore};
use relaygate::transport::Transport;

const CHAT: &str = "/v1/chat/completions";

async fn setup(channels: Vec<ChannelSpec>) -> (axum::Router, ChannelStore) {
    let store = ChannelStore::new(init_memory_pool().await.unwrap());
    store.batch_create(channels).await.unwrap();
    let transport = Arc::new(Transport::new(None).unwrap());
    let dispatcher = Dispatcher::new(store.clone(), transport);
    (
        create_router(AppState::new(dispatcher, "default")),
        store,
    )
}

fn custom(name: &str, base_url: &str, priority: i64) -> ChannelSpec {
    let mut spec = ChannelSpec::new(ProviderType::Custom, name, format!("sk-{}", name), &["gpt-4o"]);
    spec.base_url = Some(base_url.to_string());
    spec.priority = priority;
    spec
}

fn chat() -> http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(CHAT)
        .header("content-type", "application/json")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_health_reports_channel_count() {
    let (app, _) = setup(vec![custom("a", "http://a", 0), custom("b", "http://b", 0)]).await;

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "relaygate");
    assert_eq!(json["channels"], 2);
}

#[tokio::test]
async fn test_relay_passes_upstream_reply_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .and(query_param("trace", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "yes")
                .set_body_raw(r#"{"id":"chatcmpl-1","choices":[]}"#, "application/json"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let (app, _) = setup(vec![custom("alpha", &upstream.uri(), 0)]).await;

    let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("{}?trace=1", CHAT))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CHANNEL_HEADER], "alpha");
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert!(response.headers().get(ATTEMPTS_HEADER).is_none());
    assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
    assert_eq!(
        body_text(response).await,
        r#"{"id":"chatcmpl-1","choices":[]}"#
    );

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].body, body.as_bytes());
    assert_eq!(
        received[0].headers.get("authorization").unwrap(),
        "Bearer sk-alpha"
    );
}

#[tokio::test]
async fn test_streaming_reply_is_relayed_verbatim() {
    let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n\
               data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n\
               data: [DONE]\n\n";
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&upstream)
        .await;

    let (app, _) = setup(vec![custom("alpha", &upstream.uri(), 0)]).await;

    let response = app
        .oneshot(
            chat()
                .body(Body::from(r#"{"model":"gpt-4o","stream":true,"messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(body_text(response).await, sse);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].headers.get("accept").unwrap(), "text/event-stream");
}

#[tokio::test]
async fn test_failover_is_reported_in_headers() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&broken)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&healthy)
        .await;

    let (app, _) = setup(vec![
        custom("broken", &broken.uri(), 10),
        custom("healthy", &healthy.uri(), 0),
    ])
    .await;

    let response = app
        .oneshot(chat().body(Body::from(r#"{"model":"gpt-4o"}"#)).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CHANNEL_HEADER], "healthy");
    assert_eq!(response.headers()[ATTEMPTS_HEADER], "broken/502");
}

#[tokio::test]
async fn test_group_header_selects_channels() {
    let default_up = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("default"))
        .mount(&default_up)
        .await;
    let vip_up = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("vip"))
        .mount(&vip_up)
        .await;

    let mut vip = custom("vip", &vip_up.uri(), 0);
    vip.group = "vip".to_string();
    let (app, _) = setup(vec![custom("standard", &default_up.uri(), 0), vip]).await;

    let response = app
        .clone()
        .oneshot(
            chat()
                .header(RELAY_GROUP_HEADER, "vip")
                .body(Body::from(r#"{"model":"gpt-4o"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_text(response).await, "vip");

    let response = app
        .oneshot(chat().body(Body::from(r#"{"model":"gpt-4o"}"#)).unwrap())
        .await
        .unwrap();
    assert_eq!(body_text(response).await, "default");
}

#[tokio::test]
async fn test_exhaustion_returns_service_unavailable() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&broken)
        .await;

    let (app, _) = setup(vec![custom("broken", &broken.uri(), 0)]).await;

    let response = app
        .oneshot(chat().body(Body::from(r#"{"model":"gpt-4o"}"#)).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get(REQUEST_ID_HEADER).is_some());
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("gpt-4o"));
}

#[tokio::test]
async fn test_unknown_model_is_service_unavailable() {
    let (app, _) = setup(vec![custom("alpha", "http://a", 0)]).await;

    let response = app
        .oneshot(
            chat()
                .body(Body::from(r#"{"model":"no-such-model"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_missing_model_is_bad_request() {
    let (app, _) = setup(vec![]).await;

    let response = app
        .clone()
        .oneshot(chat().body(Body::from(r#"{"messages":[]}"#)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(chat().body(Body::from("not json")).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
