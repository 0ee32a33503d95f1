//! Candidate selection and failover across channels.
//!
//! Upstreams are wiremock servers registered as `custom` channels.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaygate::channel::{ChannelSpec, ChannelStatus, ProviderType};
use relaygate::error::{DispatchStage, Error};
use relaygate::notify::Notifier;
use relaygate::relay::{adaptor_for, dispatch, Dispatcher, RelayInfo, RelayRequest};
use relaygate::router::Selector;
use relaygate::storage::{init_memory_pool, ChannelStore};
use relaygate::transport::Transport;

const PATH: &str = "/v1/chat/completions";
const BODY: &str = r#"{"model":"gpt-4o","messages":[]}"#;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        subject: &str,
        recipients: &[String],
        _html_body: &str,
    ) -> relaygate::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), recipients.to_vec()));
        Ok(())
    }
}

async fn store() -> ChannelStore {
    ChannelStore::new(init_memory_pool().await.unwrap())
}

fn upstream(name: &str, base_url: &str, priority: i64) -> ChannelSpec {
    let mut spec = ChannelSpec::new(
        ProviderType::Custom,
        name,
        format!("sk-{}", name),
        &["gpt-4o"],
    );
    spec.base_url = Some(base_url.to_string());
    spec.priority = priority;
    spec
}

fn request(group: &str) -> RelayRequest {
    request_for("gpt-4o", group)
}

fn request_for(model: &str, group: &str) -> RelayRequest {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    RelayRequest {
        method: Method::POST,
        path: PATH.to_string(),
        query: None,
        headers,
        model: model.to_string(),
        group: group.to_string(),
        is_stream: false,
    }
}

fn dispatcher(store: &ChannelStore) -> Dispatcher {
    let transport = Arc::new(Transport::new(None).unwrap());
    Dispatcher::new(store.clone(), transport)
}

async fn respond(server: &MockServer, status: u16, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(PATH))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_string(format!(r#"{{"upstream_status":{}}}"#, status)),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_candidates_only_from_top_tier_first() {
    let store = store().await;
    let high_a = store.create(upstream("high-a", "http://a", 10)).await.unwrap();
    let high_b = store.create(upstream("high-b", "http://b", 10)).await.unwrap();
    let low = store.create(upstream("low", "http://c", 1)).await.unwrap();

    let selector = Selector::new(&store);
    let tiers = selector.candidates("gpt-4o", "default").await.unwrap();

    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[0].priority, 10);
    let mut top = tiers[0].channel_ids.clone();
    top.sort();
    assert_eq!(top, vec![high_a.id, high_b.id]);
    assert_eq!(tiers[1].channel_ids, vec![low.id]);
}

#[tokio::test]
async fn test_candidates_respect_group_model_and_status() {
    let store = store().await;
    let enabled = store.create(upstream("on", "http://a", 0)).await.unwrap();
    let disabled = store.create(upstream("off", "http://b", 5)).await.unwrap();
    let mut vip = upstream("vip", "http://c", 9);
    vip.group = "vip".to_string();
    store.create(vip).await.unwrap();

    store
        .set_status(disabled.id, ChannelStatus::ManuallyDisabled, "maintenance")
        .await;

    let selector = Selector::new(&store);
    let tiers = selector.candidates("gpt-4o", "default").await.unwrap();
    assert_eq!(tiers.len(), 1);
    assert_eq!(tiers[0].channel_ids, vec![enabled.id]);

    assert!(selector
        .candidates("claude-3-opus", "default")
        .await
        .unwrap()
        .is_empty());
    assert!(selector
        .candidates("gpt-4o", "nobody")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failover_walks_tiers_in_priority_order() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;
    respond(&a, 503, 1).await;
    respond(&b, 200, 1).await;
    respond(&c, 200, 0).await;

    let store = store().await;
    store.create(upstream("alpha", &a.uri(), 10)).await.unwrap();
    let beta = store.create(upstream("beta", &b.uri(), 5)).await.unwrap();
    store.create(upstream("gamma", &c.uri(), 0)).await.unwrap();

    let relayed = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await
        .unwrap();

    assert_eq!(relayed.channel_id, beta.id);
    assert_eq!(relayed.channel_name, "beta");
    assert_eq!(relayed.attempts.len(), 1);
    assert_eq!(relayed.attempts[0].channel_name, "alpha");
    assert_eq!(relayed.attempts[0].status_code, 503);
    assert_eq!(relayed.response.status(), 200);

    // A server error is not a reason to disable.
    let tiers = Selector::new(&store)
        .candidates("gpt-4o", "default")
        .await
        .unwrap();
    assert_eq!(tiers.len(), 3);

    // The serving channel gets a latency sample.
    assert!(store.get(beta.id).await.unwrap().test_time > 0);
}

#[tokio::test]
async fn test_lower_tier_served_only_after_whole_top_tier_fails() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;
    respond(&a, 500, 1).await;
    respond(&b, 502, 1).await;
    respond(&c, 200, 1).await;

    let store = store().await;
    let mut ids = Vec::new();
    for (name, server, priority, weight) in [("A", &a, 10, 1), ("B", &b, 10, 3), ("C", &c, 5, 10)] {
        let mut spec = ChannelSpec::new(ProviderType::Custom, name, format!("sk-{}", name), &["m"]);
        spec.base_url = Some(server.uri());
        spec.priority = priority;
        spec.weight = weight;
        ids.push(store.create(spec).await.unwrap().id);
    }

    let relayed = dispatcher(&store)
        .relay(&request_for("m", "default"), Bytes::from_static(br#"{"model":"m"}"#))
        .await
        .unwrap();

    assert_eq!(relayed.channel_id, ids[2]);
    assert_eq!(relayed.channel_name, "C");

    // Both top-tier channels were tried before C.
    let mut failed: Vec<&str> = relayed
        .attempts
        .iter()
        .map(|a| a.channel_name.as_str())
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["A", "B"]);
    let mut statuses: Vec<u16> = relayed.attempts.iter().map(|a| a.status_code).collect();
    statuses.sort();
    assert_eq!(statuses, vec![500, 502]);
}

#[tokio::test]
async fn test_non_success_reply_is_wrapped_with_execute_stage() {
    let server = MockServer::start().await;
    respond(&server, 503, 1).await;

    let store = store().await;
    let channel = store
        .create(upstream("alpha", &server.uri(), 0))
        .await
        .unwrap();
    let transport = Transport::new(None).unwrap();
    let info = RelayInfo::new(&channel, &request("default"));

    let err = dispatch(
        &info,
        adaptor_for(channel.provider_type),
        &transport,
        Bytes::from_static(BODY.as_bytes()),
    )
    .await
    .unwrap_err();

    match &err {
        Error::Dispatch { stage, source } => {
            assert_eq!(*stage, DispatchStage::Execute);
            assert!(matches!(**source, Error::Upstream { status: 503, .. }));
        }
        other => panic!("expected a stage-wrapped error, got {:?}", other),
    }
    assert_eq!(err.upstream_status(), Some(503));
}

#[tokio::test]
async fn test_request_carries_channel_credentials_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(PATH))
        .and(header("authorization", "Bearer sk-alpha"))
        .and(header("x-org", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let store = store().await;
    let mut spec = upstream("alpha", &server.uri(), 0);
    spec.headers = Some(r#"{"X-Org":"acme"}"#.to_string());
    store.create(spec).await.unwrap();

    let relayed = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await
        .unwrap();
    assert_eq!(relayed.response.text().await.unwrap(), "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].body, BODY.as_bytes());
}

#[tokio::test]
async fn test_unauthorized_channel_is_auto_disabled_and_reported() {
    let bad = MockServer::start().await;
    let good = MockServer::start().await;
    respond(&bad, 401, 1).await;
    respond(&good, 200, 2).await;

    let store = store().await;
    let revoked = store.create(upstream("revoked", &bad.uri(), 10)).await.unwrap();
    let backup = store.create(upstream("backup", &good.uri(), 0)).await.unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher =
        dispatcher(&store).with_notifier(notifier.clone(), vec!["ops@example.com".to_string()]);

    let relayed = dispatcher
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await
        .unwrap();
    assert_eq!(relayed.channel_id, backup.id);
    assert_eq!(relayed.attempts[0].status_code, 401);

    let reloaded = store.get(revoked.id).await.unwrap();
    assert_eq!(reloaded.status, ChannelStatus::AutoDisabled);
    assert!(reloaded.other_info.contains_key("status_reason"));

    {
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("revoked"));
        assert_eq!(sent[0].1, vec!["ops@example.com".to_string()]);
    }

    // The next request no longer reaches the disabled channel.
    let relayed = dispatcher
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await
        .unwrap();
    assert_eq!(relayed.channel_id, backup.id);
    assert!(relayed.attempts.is_empty());
}

#[tokio::test]
async fn test_auto_ban_off_keeps_channel_enabled() {
    let bad = MockServer::start().await;
    respond(&bad, 403, 1).await;

    let store = store().await;
    let mut spec = upstream("sticky", &bad.uri(), 0);
    spec.auto_ban = false;
    let sticky = store.create(spec).await.unwrap();

    let result = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await;
    assert!(matches!(result, Err(Error::Exhausted { .. })));
    assert_eq!(
        store.get(sticky.id).await.unwrap().status,
        ChannelStatus::Enabled
    );
}

#[tokio::test]
async fn test_exhaustion_after_every_channel_fails_once() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    respond(&a, 500, 1).await;
    respond(&b, 429, 1).await;

    let store = store().await;
    store.create(upstream("a", &a.uri(), 3)).await.unwrap();
    store.create(upstream("b", &b.uri(), 3)).await.unwrap();

    let result = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await;

    match result {
        Err(Error::Exhausted { model, group }) => {
            assert_eq!(model, "gpt-4o");
            assert_eq!(group, "default");
        }
        other => panic!("expected exhaustion, got {:?}", other.map(|r| r.channel_id)),
    }
}

#[tokio::test]
async fn test_no_candidates_is_exhausted_without_calls() {
    let store = store().await;
    let result = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await;
    assert!(matches!(result, Err(Error::Exhausted { .. })));
}

#[tokio::test]
async fn test_unreachable_channel_fails_over_with_status_zero() {
    let good = MockServer::start().await;
    respond(&good, 200, 1).await;

    let store = store().await;
    // Nothing listens on port 1.
    store
        .create(upstream("dead", "http://127.0.0.1:1", 10))
        .await
        .unwrap();
    store.create(upstream("live", &good.uri(), 0)).await.unwrap();

    let relayed = dispatcher(&store)
        .relay(&request("default"), Bytes::from_static(BODY.as_bytes()))
        .await
        .unwrap();
    assert_eq!(relayed.channel_name, "live");
    assert_eq!(relayed.attempts.len(), 1);
    assert_eq!(relayed.attempts[0].channel_name, "dead");
    assert_eq!(relayed.attempts[0].status_code, 0);
}

#[tokio::test]
async fn test_weighted_share_across_equal_priority() {
    let store = store().await;
    let mut heavy = upstream("heavy", "http://a", 0);
    heavy.weight = 9;
    let heavy = store.create(heavy).await.unwrap();
    let mut light = upstream("light", "http://b", 0);
    light.weight = 1;
    store.create(light).await.unwrap();

    let selector = Selector::new(&store);
    let trials = 2_000;
    let mut heavy_first = 0;
    for _ in 0..trials {
        let tiers = selector.candidates("gpt-4o", "default").await.unwrap();
        if tiers[0].channel_ids[0] == heavy.id {
            heavy_first += 1;
        }
    }

    let share = heavy_first as f64 / trials as f64;
    assert!((share - 0.9).abs() < 0.05, "heavy drawn first {:.3}", share);
}
