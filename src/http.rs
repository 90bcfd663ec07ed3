//! HTTP surface: routes, admission middleware and response mapping.

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::IpAddr, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info};

use crate::{
    admission::{AdmissionDecision, AdmissionRequest, DecisionReason},
    auth::extract_api_key,
    metrics::Metrics,
    service::{GatewayService, IngestError},
    settings::CorsOrigins,
    utils::{canonical_ip, ceil_secs, first_forwarded_ip, UNKNOWN_CLIENT_IP},
};

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GatewayService>,
    pub metrics: Arc<Metrics>,
    /// Take the source address from `X-Forwarded-For` when set
    pub trust_forwarded_for: bool,
}

/// Build the gateway router. Every route passes admission control.
///
/// CORS wraps everything else, so preflight requests are answered before
/// admission and never count against a source.
pub fn router(state: AppState, cors: &CorsOrigins) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/events/batch", post(submit_batch))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admission_control))
        .layer(middleware::from_fn(security_headers))
        .layer(DefaultBodyLimit::disable())
        .layer(cors_layer(cors))
        .with_state(state)
}

pub fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    let allow_origin = match origins {
        CorsOrigins::Any => AllowOrigin::any(),
        CorsOrigins::List(list) => AllowOrigin::list(list.iter().cloned()),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::RETRY_AFTER])
        .max_age(CORS_MAX_AGE)
}

async fn admission_control(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client_ip = client_ip(&request, state.trust_forwarded_for);
    let api_key = extract_api_key(request.headers());
    let route = request.uri().path().to_string();

    let decision = state
        .service
        .admit(&AdmissionRequest {
            route: &route,
            client_ip,
            api_key: api_key.as_deref(),
        })
        .await;

    if !decision.allowed {
        return rejection(&decision);
    }
    next.run(request).await
}

fn client_ip(request: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(first_forwarded_ip);
        if let Some(ip) = forwarded {
            return canonical_ip(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| canonical_ip(addr.ip()))
        .unwrap_or(UNKNOWN_CLIENT_IP)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    response
}

fn rejection(decision: &AdmissionDecision) -> Response {
    let (status, message) = match decision.reason {
        DecisionReason::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded"),
        DecisionReason::IpBlocked => (StatusCode::FORBIDDEN, "Source address is blocked"),
        DecisionReason::Unauthorized => (StatusCode::UNAUTHORIZED, "Missing or invalid API key"),
        DecisionReason::ForbiddenRoute => {
            (StatusCode::FORBIDDEN, "API key is not permitted on this route")
        }
        DecisionReason::None => (StatusCode::INTERNAL_SERVER_ERROR, "Request was not admitted"),
    };
    let retry_after_secs = decision.retry_after.map(ceil_secs);

    let body = Json(json!({
        "error": "policy_rejection",
        "reason": decision.reason,
        "message": message,
        "retry_after_secs": retry_after_secs,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));

    let mut response = (status, body).into_response();
    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    let body = Json(json!({
        "success": false,
        "error": error,
        "message": message,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));
    (status, body).into_response()
}

fn ingest_error_response(err: IngestError) -> Response {
    match err {
        IngestError::Validation(e) => {
            debug!(index = ?e.index, error = %e.message, "Rejected invalid payload");
            let body = Json(json!({
                "success": false,
                "error": "validation_error",
                "message": e.to_string(),
                "index": e.index,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }));
            (StatusCode::BAD_REQUEST, body).into_response()
        }
        IngestError::BrokerUnavailable => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "broker_unavailable",
            err.to_string(),
        ),
        IngestError::Publish(ref e) => {
            error!(error = %e, "Event publish failed");
            error_response(StatusCode::BAD_GATEWAY, "publish_failed", err.to_string())
        }
        IngestError::DeadlineExceeded(_) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded", err.to_string())
        }
    }
}

/// Read the body, bounded by the route's payload limit
async fn read_body(state: &AppState, route: &str, headers: &HeaderMap, body: Body) -> Result<Bytes, Response> {
    let limit = state.service.max_payload_bytes(route).await;
    let too_large = || {
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {} bytes", limit),
        )
    };

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(too_large());
    }

    to_bytes(body, limit).await.map_err(|_| too_large())
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    Json(state.service.health().await).into_response()
}

async fn submit_event(State(state): State<AppState>, request: Request) -> Response {
    let _timer = state.metrics.start_request_timer();
    let (parts, body) = request.into_parts();
    let raw = match read_body(&state, parts.uri.path(), &parts.headers, body).await {
        Ok(raw) => raw,
        Err(response) => return response,
    };

    match state.service.ingest_event(&raw).await {
        Ok(published) => {
            info!(
                event_id = %published.event_id,
                correlation_id = %published.correlation_id,
                "Event accepted"
            );
            Json(json!({
                "success": true,
                "message": format!("Event published to {}", state.service.destination()),
                "event_id": published.event_id,
                "correlation_id": published.correlation_id,
            }))
            .into_response()
        }
        Err(e) => ingest_error_response(e),
    }
}

async fn submit_batch(State(state): State<AppState>, request: Request) -> Response {
    let _timer = state.metrics.start_request_timer();
    let (parts, body) = request.into_parts();
    let raw = match read_body(&state, parts.uri.path(), &parts.headers, body).await {
        Ok(raw) => raw,
        Err(response) => return response,
    };

    match state.service.ingest_batch(&raw).await {
        Ok(report) => {
            let status = if report.all_succeeded() {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            let body = Json(json!({
                "success": report.all_succeeded(),
                "message": format!(
                    "Processed {} events: {} successful, {} failed",
                    report.total_count(),
                    report.successful_count(),
                    report.failed_count()
                ),
                "total_count": report.total_count(),
                "successful_count": report.successful_count(),
                "failed_count": report.failed_count(),
                "results": report.results,
            }));
            (status, body).into_response()
        }
        Err(e) => ingest_error_response(e),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
