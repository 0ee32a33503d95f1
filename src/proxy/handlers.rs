//! HTTP request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;
use serde::Deserialize;

use super::server::{AppState, RequestId};
use crate::error::Error;
use crate::relay::{format_attempts_header, RelayRequest};

/// Request header naming the channel group to route within.
pub const RELAY_GROUP_HEADER: &str = "x-relay-group";

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-relaygate-request-id";
/// Response header: name of the channel that served the request.
pub const CHANNEL_HEADER: &str = "x-relaygate-channel";
/// Response header: failed attempts before the serving channel, `name/status`.
pub const ATTEMPTS_HEADER: &str = "x-relaygate-attempts";

/// The routing fields of an inbound JSON body. Everything else is opaque.
#[derive(Debug, Deserialize)]
struct RoutingFields {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: bool,
}

fn parse_routing_fields(body: &[u8]) -> Result<RoutingFields, Error> {
    let fields: RoutingFields = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("body must be a JSON object: {}", e)))?;
    if fields.model.trim().is_empty() {
        return Err(Error::BadRequest("model is required".to_string()));
    }
    Ok(fields)
}

/// Hop-by-hop and framing headers that must not be copied from upstream.
fn is_forwardable(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection" | "transfer-encoding" | "content-length" | "keep-alive"
    )
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Handle POST /v1/*path: pick a channel and stream its reply back.
pub async fn relay(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = request_id.0.to_string();

    let fields = match parse_routing_fields(&body) {
        Ok(fields) => fields,
        Err(e) => {
            let mut response = e.into_response();
            insert_header(&mut response, REQUEST_ID_HEADER, &correlation_id);
            return response;
        }
    };

    let group = headers
        .get(RELAY_GROUP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or(&*state.default_group)
        .to_string();

    tracing::info!(
        request_id = %correlation_id,
        path = %uri.path(),
        model = %fields.model,
        group = %group,
        stream = fields.stream,
        "Received relay request"
    );

    let request = RelayRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        model: fields.model,
        group,
        is_stream: fields.stream,
    };

    let relayed = match state.dispatcher.relay(&request, body).await {
        Ok(relayed) => relayed,
        Err(e) => {
            let mut response = e.into_response();
            insert_header(&mut response, REQUEST_ID_HEADER, &correlation_id);
            return response;
        }
    };

    let status = relayed.response.status();
    let upstream_headers = relayed.response.headers().clone();
    let stream = relayed
        .response
        .bytes_stream()
        .map_err(std::io::Error::other);

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    for (name, value) in upstream_headers.iter() {
        if is_forwardable(name) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    if request.is_stream && !response.headers().contains_key(header::CACHE_CONTROL) {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    insert_header(&mut response, REQUEST_ID_HEADER, &correlation_id);
    insert_header(&mut response, CHANNEL_HEADER, &relayed.channel_name);
    if let Some(attempts) = format_attempts_header(&relayed.attempts) {
        insert_header(&mut response, ATTEMPTS_HEADER, &attempts);
    }
    response
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    match state.dispatcher.store().count().await {
        Ok(channels) => Json(serde_json::json!({
            "status": "ok",
            "service": "relaygate",
            "channels": channels,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check could not reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "service": "relaygate",
                })),
            )
                .into_response()
        }
    }
}
