//! Delivery integration tests against mock receivers.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hookrelay::config::DeliveryConfig;
use hookrelay::webhooks::delivery::ENDPOINT_INACTIVE;
use hookrelay::webhooks::endpoint::RegisteredEndpoint;
use hookrelay::webhooks::queue::DeliveryReceiver;
use hookrelay::error::WebhookError;
use hookrelay::webhooks::signer::{
    self, DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use hookrelay::webhooks::{
    Actor, Delivery, DeliveryQueue, DeliveryStatus, DeliveryStore, DispatchOutcome, Dispatcher,
    EndpointRegistry, NewEndpoint, RetryPolicy, WebhookManager, WorkerPool,
};

struct Harness {
    manager: WebhookManager,
    dispatcher: Arc<Dispatcher>,
    queue: DeliveryQueue,
    receiver: Option<DeliveryReceiver>,
    owner: Actor,
}

fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        timeout_secs: 2,
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 50,
            use_jitter: false,
        },
        ..Default::default()
    }
}

fn harness(config: DeliveryConfig) -> Harness {
    let endpoints = EndpointRegistry::new();
    let deliveries = DeliveryStore::new();
    let (queue, receiver) = DeliveryQueue::new();
    let dispatcher = Dispatcher::new(endpoints.clone(), deliveries.clone(), config).unwrap();

    Harness {
        manager: WebhookManager::new(endpoints, deliveries, queue.clone()),
        dispatcher: Arc::new(dispatcher),
        queue,
        receiver: Some(receiver),
        owner: Actor::person(Uuid::new_v4()),
    }
}

async fn register(h: &Harness, url: String, events: &[&str]) -> RegisteredEndpoint {
    h.manager
        .register_endpoint(
            &h.owner,
            NewEndpoint {
                name: "community sync".to_string(),
                url,
                events: events.iter().map(|e| e.to_string()).collect(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_delivered_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhooks"))
        .and(header("content-type", "application/json"))
        .and(header(EVENT_HEADER, "community.created"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    let endpoint = register(&h, format!("{}/webhooks", server.uri()), &["community.created"]).await;

    let payload = json!({"id": "X", "name": "Test"});
    let ids = h.manager.publish("community.created", payload.clone()).await.unwrap();
    assert_eq!(ids.len(), 1);

    let outcome = h.dispatcher.dispatch(ids[0]).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered);

    let delivery = h.manager.delivery(&h.owner, ids[0]).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.response_code, Some(200));
    assert_eq!(delivery.response_body.as_deref(), Some("{\"ok\":true}"));
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.delivered_at.is_some());
    assert_eq!(delivery.endpoint_id, endpoint.endpoint.id);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let header_value = |name: &str| {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| panic!("missing header {}", name))
    };

    assert_eq!(header_value(DELIVERY_ID_HEADER), ids[0].to_string());
    assert!(header_value("user-agent").starts_with("hookrelay/"));

    let timestamp = header_value(TIMESTAMP_HEADER);
    assert!(timestamp.parse::<i64>().is_ok());

    let signature = header_value(SIGNATURE_HEADER);
    assert!(signer::verify(&endpoint.secret, &timestamp, &request.body, &signature));
    assert!(!signer::verify("some-other-secret", &timestamp, &request.body, &signature));
    assert_eq!(signature, signer::sign(&endpoint.secret, &timestamp, &request.body));

    let envelope: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(envelope["event"], "community.created");
    assert_eq!(envelope["data"], payload);
    assert!(envelope["timestamp"].is_string());
}

#[tokio::test]
async fn test_inactive_endpoint_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    let endpoint = register(&h, format!("{}/webhooks", server.uri()), &[]).await;

    let ids = h.manager.publish("post.created", json!({"id": 1})).await.unwrap();
    h.manager
        .deactivate_endpoint(&h.owner, endpoint.endpoint.id)
        .await
        .unwrap();

    let outcome = h.dispatcher.dispatch(ids[0]).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Failed);

    let delivery = h.manager.delivery(&h.owner, ids[0]).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.response_body.as_deref(), Some(ENDPOINT_INACTIVE));
    assert_eq!(delivery.attempts, 0);
    assert!(delivery.delivered_at.is_none());
}

#[tokio::test]
async fn test_server_errors_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(5)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    for attempt in 1..5u32 {
        let outcome = h.dispatcher.dispatch(id).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retry(_)), "attempt {}: {:?}", attempt, outcome);

        let delivery = h.manager.deliveries().get(id).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Retrying);
        assert_eq!(delivery.attempts, attempt);
        assert_eq!(delivery.response_code, Some(500));
        assert!(delivery.next_attempt_at.is_some());
    }

    let outcome = h.dispatcher.dispatch(id).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Failed);

    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 5);
    assert_eq!(delivery.response_body.as_deref(), Some("boom"));
    assert!(delivery.delivered_at.is_none());

    // Terminal: no sixth request
    let outcome = h.dispatcher.dispatch(id).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Skipped(DeliveryStatus::Failed));
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = delivery_config();
    config.retry.base_delay_ms = 1000;
    config.retry.max_delay_ms = 3000;
    let h = harness(config);
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    let mut delays = Vec::new();
    for _ in 0..4 {
        match h.dispatcher.dispatch(id).await.unwrap() {
            DispatchOutcome::Retry(delay) => delays.push(delay),
            other => panic!("expected retry, got {:?}", other),
        }
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(3000),
            Duration::from_millis(3000),
        ]
    );
}

#[tokio::test]
async fn test_redirect_is_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhooks"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/elsewhere"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    assert!(matches!(
        h.dispatcher.dispatch(id).await.unwrap(),
        DispatchOutcome::Retry(_)
    ));
    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.response_code, Some(302));
}

#[tokio::test]
async fn test_response_body_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(5000)))
        .mount(&server)
        .await;

    let mut config = delivery_config();
    config.response_body_limit = 16;
    let h = harness(config);
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    h.dispatcher.dispatch(id).await.unwrap();
    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.response_body.map(|b| b.len()), Some(16));
}

#[tokio::test]
async fn test_timeout_recorded_as_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut config = delivery_config();
    config.timeout_secs = 1;
    let h = harness(config);
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    assert!(matches!(
        h.dispatcher.dispatch(id).await.unwrap(),
        DispatchOutcome::Retry(_)
    ));
    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Retrying);
    assert_eq!(delivery.response_code, None);
    assert_eq!(delivery.response_body.as_deref(), Some("Request timeout (1s)"));
}

#[tokio::test]
async fn test_delivered_is_never_redelivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    assert_eq!(h.dispatcher.dispatch(id).await.unwrap(), DispatchOutcome::Delivered);
    for _ in 0..3 {
        assert_eq!(
            h.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Skipped(DeliveryStatus::Delivered)
        );
    }
    assert_eq!(h.manager.deliveries().get(id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn test_publish_refuses_event_with_control_characters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    let endpoint = register(&h, format!("{}/webhooks", server.uri()), &[]).await;

    let err = h
        .manager
        .publish("post.created\nX-Injected: 1", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::Validation { .. }));
    assert!(h
        .manager
        .deliveries_for(&h.owner, endpoint.endpoint.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unbuildable_request_fails_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(delivery_config());
    let endpoint = register(&h, format!("{}/webhooks", server.uri()), &[]).await;

    // Stored directly, as a record written before event names were checked
    let delivery = Delivery::new(endpoint.endpoint.id, "post.created\nX-Injected: 1", json!({}));
    let id = delivery.id;
    h.manager.deliveries().insert(delivery).await;

    assert_eq!(h.dispatcher.dispatch(id).await.unwrap(), DispatchOutcome::Failed);

    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 0);
    assert_eq!(delivery.response_code, None);
    assert!(delivery.next_attempt_at.is_none());
    assert!(delivery
        .response_body
        .as_deref()
        .is_some_and(|body| body.starts_with("Request rejected")));

    assert_eq!(
        h.dispatcher.dispatch(id).await.unwrap(),
        DispatchOutcome::Skipped(DeliveryStatus::Failed)
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_large_response_body_is_not_fully_buffered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(8 * 1024 * 1024)))
        .mount(&server)
        .await;

    let mut config = delivery_config();
    config.timeout_secs = 5;
    config.response_body_limit = 32;
    let h = harness(config);
    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("post.created", json!({})).await.unwrap()[0];

    assert_eq!(h.dispatcher.dispatch(id).await.unwrap(), DispatchOutcome::Delivered);
    let delivery = h.manager.deliveries().get(id).await.unwrap();
    assert_eq!(delivery.response_body, Some("y".repeat(32)));
}

async fn wait_for_terminal(h: &Harness, id: Uuid) -> Delivery {
    for _ in 0..250 {
        let delivery = h.manager.deliveries().get(id).await.unwrap();
        if delivery.status.is_terminal() {
            return delivery;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("delivery {} never reached a terminal state", id);
}

#[tokio::test]
async fn test_worker_pool_retries_until_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut h = harness(delivery_config());
    let pool = WorkerPool::spawn(
        h.dispatcher.clone(),
        h.queue.clone(),
        h.receiver.take().unwrap(),
        2,
    );

    register(&h, format!("{}/webhooks", server.uri()), &[]).await;
    let id = h.manager.publish("community.created", json!({"id": "X"})).await.unwrap()[0];

    let delivery = wait_for_terminal(&h, id).await;
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 3);
    assert_eq!(delivery.response_code, Some(200));

    pool.shutdown();
}

#[tokio::test]
async fn test_worker_pool_delivers_test_ping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header(EVENT_HEADER, "webhook.test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut h = harness(delivery_config());
    let pool = WorkerPool::spawn(
        h.dispatcher.clone(),
        h.queue.clone(),
        h.receiver.take().unwrap(),
        1,
    );

    // Subscribed to something else; the test event goes out regardless
    let endpoint = register(&h, format!("{}/webhooks", server.uri()), &["post.created"]).await;
    let queued = h
        .manager
        .trigger_test(&h.owner, endpoint.endpoint.id)
        .await
        .unwrap();

    let delivery = wait_for_terminal(&h, queued.id).await;
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.event, "webhook.test");

    pool.shutdown();
}
