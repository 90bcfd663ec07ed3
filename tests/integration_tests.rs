use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use event_gateway::{
    admission::AdmissionController,
    broker::{Destination, InMemoryBroker, RetryPolicy, RetryingPublisher},
    config::{load_policy_from_yaml, PolicyConfig},
    error::PublishError,
    event::EventNormalizer,
    http::{router, AppState},
    metrics::Metrics,
    policy::PolicyStore,
    service::GatewayService,
    settings::CorsOrigins,
    utils::TimeSource,
};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceExt;

// 2024-01-01T00:00:00Z, aligned to every window unit
const START: i64 = 1_704_067_200;

const DEV_KEY: &str = "dev-api-key-123";
const MONITORING_KEY: &str = "monitoring-key-456";

const POLICY: &str = r#"
default_route:
  rate_limit:
    requests_per_unit: 100
    unit: minute
routes:
  /:
    auth_required: false
    rate_limit:
      requests_per_unit: 100
      unit: minute
  /health:
    auth_required: false
    rate_limit:
      requests_per_unit: 1000
      unit: minute
  /events:
    max_payload_bytes: 1024
    rate_limit:
      requests_per_unit: 3
      unit: minute
  /events/batch:
    rate_limit:
      requests_per_unit: 10
      unit: minute
  /metrics:
    rate_limit:
      requests_per_unit: 60
      unit: minute
api_keys:
  dev-api-key-123:
    description: Development key
    routes: ["/events", "/events/batch"]
  monitoring-key-456:
    routes: ["/metrics"]
  retired-key:
    enabled: false
    routes: ["/events"]
ip_rules:
  deny: ["192.0.2.0/24"]
  auto_block:
    threshold: 3
    violation_window_secs: 60
    block_duration_secs: 300
"#;

const ALLOW_LIST_POLICY: &str = r#"
default_route:
  rate_limit:
    requests_per_unit: 100
    unit: minute
api_keys:
  dev-api-key-123:
    routes: ["/events"]
ip_rules:
  allow: ["10.0.0.0/8"]
"#;

struct Gateway {
    app: Router,
    broker: Arc<InMemoryBroker>,
    time: TimeSource,
}

fn build(policy_yaml: &str, trust_forwarded_for: bool) -> (Router, Arc<GatewayService>, TimeSource) {
    build_with_cors(policy_yaml, trust_forwarded_for, &CorsOrigins::Any)
}

fn build_with_cors(
    policy_yaml: &str,
    trust_forwarded_for: bool,
    cors: &CorsOrigins,
) -> (Router, Arc<GatewayService>, TimeSource) {
    let time = TimeSource::manual(START);
    let config = PolicyConfig::compile(load_policy_from_yaml(policy_yaml).unwrap()).unwrap();
    let metrics = Arc::new(Metrics::new().unwrap());
    let admission = AdmissionController::new(
        Arc::new(PolicyStore::new(config)),
        metrics.clone(),
        time.clone(),
    );
    let service = Arc::new(GatewayService::new(
        admission,
        EventNormalizer::new("api", 5, time.clone()),
        Destination::Queue("events".to_string()),
        metrics.clone(),
        Duration::from_secs(5),
        time.clone(),
    ));

    let app = router(
        AppState {
            service: service.clone(),
            metrics,
            trust_forwarded_for,
        },
        cors,
    );
    (app, service, time)
}

async fn gateway_with(policy_yaml: &str) -> Gateway {
    let (app, service, time) = build(policy_yaml, false);
    let broker = Arc::new(InMemoryBroker::new());
    let retrying = RetryingPublisher::new(
        broker.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(1),
        },
        Arc::new(Metrics::new().unwrap()),
    );
    service.set_publisher(Arc::new(retrying)).await;
    Gateway { app, broker, time }
}

async fn gateway() -> Gateway {
    gateway_with(POLICY).await
}

fn request(method: &str, path: &str, ip: &str, key: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    let mut request = builder.body(body).unwrap();
    let addr: SocketAddr = format!("{}:40000", ip).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn post(path: &str, ip: &str, key: Option<&str>, payload: Value) -> Request<Body> {
    request("POST", path, ip, key, Body::from(payload.to_string()))
}

fn get(path: &str, ip: &str, key: Option<&str>) -> Request<Body> {
    request("GET", path, ip, key, Body::empty())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let (status, headers, body) = send(app, request).await;
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, headers, value)
}

fn sample_event() -> Value {
    json!({
        "event_type": "test_event",
        "data": {"message": "test"},
        "source": "deployment_test"
    })
}

#[tokio::test]
async fn test_event_is_published_exactly_once() {
    let gw = gateway().await;

    let (status, _, body) = send_json(&gw.app, post("/events", "10.0.0.1", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let correlation_id = body["correlation_id"].as_str().unwrap();
    assert!(!correlation_id.is_empty());
    assert!(body["event_id"].as_str().unwrap().starts_with("evt_"));

    let published = gw.broker.published().await;
    assert_eq!(published.len(), 1);
    let (destination, record) = &published[0];
    assert_eq!(destination, &Destination::Queue("events".to_string()));
    assert_eq!(record.event_type, "test_event");
    assert_eq!(record.data, json!({"message": "test"}));
    assert_eq!(record.source, "deployment_test");
    assert_eq!(record.correlation_id, correlation_id);
}

#[tokio::test]
async fn test_caller_correlation_id_is_echoed() {
    let gw = gateway().await;
    let mut payload = sample_event();
    payload["correlation_id"] = json!("order-42");

    let (status, _, body) = send_json(&gw.app, post("/events", "10.0.0.1", Some(DEV_KEY), payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["correlation_id"], "order-42");
}

#[tokio::test]
async fn test_bearer_token_is_accepted() {
    let gw = gateway().await;
    let mut req = post("/events", "10.0.0.1", None, sample_event());
    req.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", DEV_KEY).parse().unwrap(),
    );

    let (status, _, _) = send(&gw.app, req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_transient_broker_failure_is_retried() {
    let gw = gateway().await;
    gw.broker
        .fail_next([PublishError::Transient("throttled".to_string())])
        .await;

    let (status, _, _) = send(&gw.app, post("/events", "10.0.0.1", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gw.broker.published().await.len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_return_bad_gateway() {
    let gw = gateway().await;
    gw.broker
        .fail_next((0..3).map(|_| PublishError::Transient("down".to_string())))
        .await;

    let (status, _, body) = send_json(&gw.app, post("/events", "10.0.0.1", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "publish_failed");
    assert!(gw.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_missing_and_invalid_keys_are_unauthorized() {
    let gw = gateway().await;

    for key in [None, Some("wrong-key"), Some("retired-key")] {
        let (status, headers, body) = send_json(&gw.app, post("/events", "10.0.0.2", key, sample_event())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "policy_rejection");
        assert_eq!(body["reason"], "unauthorized");
        assert!(body["retry_after_secs"].is_null());
        assert!(headers.get(header::RETRY_AFTER).is_none());
    }
    assert!(gw.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_key_without_route_permission_is_forbidden() {
    let gw = gateway().await;

    let (status, _, body) = send_json(
        &gw.app,
        post("/events", "10.0.0.3", Some(MONITORING_KEY), sample_event()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "forbidden_route");
}

#[tokio::test]
async fn test_rate_limit_and_window_rollover() {
    let gw = gateway().await;

    for _ in 0..3 {
        let (status, _, _) = send(&gw.app, post("/events", "10.0.0.4", Some(DEV_KEY), sample_event())).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = send_json(&gw.app, post("/events", "10.0.0.4", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], "rate_limited");
    assert_eq!(body["retry_after_secs"], 60);
    assert_eq!(headers[header::RETRY_AFTER], "60");
    assert_eq!(gw.broker.published().await.len(), 3);

    gw.time.advance(Duration::from_secs(60));
    let (status, _, _) = send(&gw.app, post("/events", "10.0.0.4", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_denied_network_is_always_blocked() {
    let gw = gateway().await;

    for _ in 0..5 {
        let (status, _, body) = send_json(
            &gw.app,
            post("/events", "192.0.2.77", Some(DEV_KEY), sample_event()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], "ip_blocked");
    }

    // the deny list applies to unauthenticated routes too
    let (status, _, _) = send(&gw.app, get("/health", "192.0.2.77", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(gw.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_allow_list() {
    let gw = gateway_with(ALLOW_LIST_POLICY).await;

    let (status, _, _) = send(&gw.app, post("/events", "10.1.2.3", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send_json(
        &gw.app,
        post("/events", "203.0.113.5", Some(DEV_KEY), sample_event()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "ip_blocked");
}

#[tokio::test]
async fn test_repeated_auth_failures_block_the_source() {
    let gw = gateway().await;
    let ip = "10.0.0.50";

    for guess in ["guess-1", "guess-2", "guess-3"] {
        let (status, _, _) = send(&gw.app, post("/events", ip, Some(guess), sample_event())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let (status, headers, body) = send_json(&gw.app, post("/events", ip, Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "ip_blocked");
    assert_eq!(headers[header::RETRY_AFTER], "300");

    // other sources are unaffected
    let (status, _, _) = send(&gw.app, post("/events", "10.0.0.51", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);

    gw.time.advance(Duration::from_secs(300));
    let (status, _, _) = send(&gw.app, post("/events", ip, Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_batch_with_invalid_element_publishes_nothing() {
    let gw = gateway().await;
    let batch = json!([
        {"event_type": "a"},
        {"event_type": "b"},
        {"data": {"no": "type"}},
        {"event_type": "d"},
        {"event_type": "e"}
    ]);

    let (status, _, body) = send_json(&gw.app, post("/events/batch", "10.0.0.6", Some(DEV_KEY), batch)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["index"], 2);
    assert!(body["message"].as_str().unwrap().contains("index 2"));
    assert!(gw.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_batch_success() {
    let gw = gateway().await;
    let batch = json!([
        {"event_type": "a", "correlation_id": "c-0"},
        {"event_type": "b"}
    ]);

    let (status, _, body) = send_json(&gw.app, post("/events/batch", "10.0.0.7", Some(DEV_KEY), batch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["successful_count"], 2);
    assert_eq!(body["failed_count"], 0);
    assert_eq!(body["results"][0]["correlation_id"], "c-0");
    assert_eq!(body["results"][1]["index"], 1);
    assert_eq!(gw.broker.published().await.len(), 2);
}

#[tokio::test]
async fn test_batch_partial_failure_is_reported_per_item() {
    let gw = gateway().await;
    gw.broker
        .fail_next([PublishError::Permanent("message too large".to_string())])
        .await;

    let batch = json!([{"event_type": "a"}, {"event_type": "b"}, {"event_type": "c"}]);
    let (status, _, body) = send_json(&gw.app, post("/events/batch", "10.0.0.8", Some(DEV_KEY), batch)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
    assert_eq!(body["successful_count"], 2);
    assert_eq!(body["failed_count"], 1);
    assert_eq!(body["results"][0]["success"], false);
    assert!(body["results"][0]["error"]
        .as_str()
        .unwrap()
        .contains("message too large"));
    assert_eq!(body["results"][1]["success"], true);
    assert_eq!(gw.broker.published().await.len(), 2);
}

#[tokio::test]
async fn test_oversized_batch_is_rejected() {
    let gw = gateway().await;
    let batch = Value::Array((0..6).map(|_| json!({"event_type": "a"})).collect());

    let (status, _, _) = send(&gw.app, post("/events/batch", "10.0.0.9", Some(DEV_KEY), batch)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payload_too_large() {
    let gw = gateway().await;
    let payload = json!({"event_type": "big", "data": {"blob": "x".repeat(2048)}});

    let (status, _, body) = send_json(&gw.app, post("/events", "10.0.0.10", Some(DEV_KEY), payload)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "payload_too_large");
    assert!(gw.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_a_client_error() {
    let gw = gateway().await;
    let req = request("POST", "/events", "10.0.0.11", Some(DEV_KEY), Body::from("{not json"));

    let (status, _, body) = send_json(&gw.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_health_needs_no_key() {
    let gw = gateway().await;

    let (status, _, body) = send_json(&gw.app, get("/health", "10.0.0.12", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["broker_connected"], true);
    assert_eq!(body["policy_version"], 1);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_without_broker_events_are_unavailable() {
    let (app, _service, _time) = build(POLICY, false);

    let (status, _, body) = send_json(&app, get("/health", "10.0.0.13", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker_connected"], false);

    let (status, _, body) = send_json(&app, post("/events", "10.0.0.13", Some(DEV_KEY), sample_event())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "broker_unavailable");
}

#[tokio::test]
async fn test_security_headers_on_every_response() {
    let gw = gateway().await;

    let responses = [
        send(&gw.app, get("/", "10.0.0.14", None)).await,
        send(&gw.app, post("/events", "10.0.0.14", None, sample_event())).await,
    ];
    for (_, headers, _) in responses {
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(
            headers["strict-transport-security"],
            "max-age=31536000; includeSubDomains"
        );
    }
}

fn preflight(path: &str, ip: &str, origin: &str) -> Request<Body> {
    let mut request = request("OPTIONS", path, ip, None, Body::empty());
    let headers = request.headers_mut();
    headers.insert(header::ORIGIN, origin.parse().unwrap());
    headers.insert(header::ACCESS_CONTROL_REQUEST_METHOD, "POST".parse().unwrap());
    headers.insert(
        header::ACCESS_CONTROL_REQUEST_HEADERS,
        "x-api-key,content-type".parse().unwrap(),
    );
    request
}

#[tokio::test]
async fn test_cors_preflight_skips_admission() {
    let gw = gateway().await;

    // well past both the rate limit and the auto-block threshold
    for _ in 0..5 {
        let (status, headers, _) = send(&gw.app, preflight("/events", "10.0.0.30", "https://app.example.com")).await;
        assert!(status.is_success());
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    for _ in 0..3 {
        let (status, _, _) = send(&gw.app, post("/events", "10.0.0.30", Some(DEV_KEY), sample_event())).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(gw.broker.published().await.len(), 3);
}

#[tokio::test]
async fn test_cors_headers_on_rejections() {
    let gw = gateway().await;

    let mut req = post("/events", "10.0.0.31", None, sample_event());
    req.headers_mut()
        .insert(header::ORIGIN, "https://app.example.com".parse().unwrap());
    let (status, headers, _) = send(&gw.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_cors_origin_list() {
    let origins = CorsOrigins::parse("https://app.example.com").unwrap();
    let (app, _service, _time) = build_with_cors(POLICY, false, &origins);

    let (status, headers, _) = send(&app, preflight("/events", "10.0.0.32", "https://app.example.com")).await;
    assert!(status.is_success());
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");

    let (_, headers, _) = send(&app, preflight("/events", "10.0.0.32", "https://other.example.org")).await;
    assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn test_root_and_metrics() {
    let gw = gateway().await;

    let (status, _, body) = send_json(&gw.app, get("/", "10.0.0.15", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "event-gateway");

    let (status, _, _) = send(&gw.app, get("/metrics", "10.0.0.15", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(&gw.app, get("/metrics", "10.0.0.15", Some(MONITORING_KEY))).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("gateway_admission_decisions_total"));
}

#[tokio::test]
async fn test_forwarded_for_is_used_when_trusted() {
    let (app, service, _time) = build(POLICY, true);
    service.set_publisher(Arc::new(InMemoryBroker::new())).await;

    let mut req = post("/events", "10.0.0.16", Some(DEV_KEY), sample_event());
    req.headers_mut()
        .insert("x-forwarded-for", "192.0.2.9, 10.0.0.16".parse().unwrap());
    let (status, _, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "ip_blocked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_respect_the_limit() {
    let gw = gateway().await;

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let app = gw.app.clone();
            tokio::spawn(async move {
                send(&app, post("/events", "10.0.0.17", Some(DEV_KEY), sample_event()))
                    .await
                    .0
            })
        })
        .collect();

    let mut ok = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            StatusCode::OK => ok += 1,
            // rate limit violations eventually block the source
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => rejected += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(rejected, 17);
    assert_eq!(gw.broker.published().await.len(), 3);
}

#[tokio::test]
async fn test_shipped_policy_loads() {
    let store = PolicyStore::from_file("config/policy.yaml").unwrap();
    let policy = store.snapshot().await;

    assert!(!policy.route("/health").auth_required);
    assert_eq!(policy.route("/events").rate_limit.requests_per_unit, 100);
    assert_eq!(policy.route("/events/batch").rate_limit.requests_per_unit, 10);
    assert_eq!(policy.route("/events/batch").max_payload_bytes, 10 * 1024 * 1024);
    assert!(policy.api_key(DEV_KEY).unwrap().permits("/events"));
    assert!(policy.api_key(MONITORING_KEY).unwrap().permits("/metrics"));
}
