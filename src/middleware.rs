//! Axum middleware adapter.
//!
//! Buffers the GraphQL POST body, runs the gate, and either forwards the
//! request with the admission record attached to its extensions or renders
//! the rejection as `429` with `Retry-After` and `X-RateLimit-Remaining`
//! headers. The host mounts it with `middleware::from_fn_with_state`.

use crate::error::GateError;
use crate::gate::{client_identity, Gate, GateDecision, GateRequest};
use crate::response::{ErrorBody, RejectionBody};
use crate::store::CounterStore;
use async_graphql::Variables;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Queries larger than this are rejected before parsing.
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct GraphQlPayload {
    query: String,
    #[serde(default)]
    variables: Option<serde_json::Value>,
}

pub async fn gate_middleware<S: CounterStore + 'static>(
    State(gate): State<Arc<Gate<S>>>,
    request: Request,
    next: Next,
) -> Response {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let client_id = client_identity(forwarded.as_deref(), &remote);

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                vec![format!("unreadable request body: {}", error)],
            );
        }
    };

    let payload: GraphQlPayload = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                vec![format!("malformed GraphQL payload: {}", error)],
            );
        }
    };

    let gate_request = GateRequest {
        query: payload.query,
        variables: payload
            .variables
            .map(Variables::from_json)
            .unwrap_or_default(),
        client_id,
    };

    match gate.handle(&gate_request).await {
        Ok(GateDecision::Admit(record)) => {
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        Ok(GateDecision::Reject { retry_after_ms, record }) => {
            let retry_after_seconds = retry_after_ms.div_ceil(1000);
            let remaining = record.tokens.max(0.0).floor() as u64;

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RejectionBody::new(retry_after_ms, record)),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        Err(error) => gate_error_response(error),
    }
}

fn gate_error_response(error: GateError) -> Response {
    match error {
        GateError::Query(errors) => error_response(StatusCode::BAD_REQUEST, errors),
        GateError::DepthLimitExceeded { .. } => {
            error_response(StatusCode::BAD_REQUEST, vec![error.to_string()])
        }
        GateError::Store(_) | GateError::StoreUnavailable(_) => {
            warn!(%error, "counter store failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, vec![error.to_string()])
        }
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, vec![other.to_string()]),
    }
}

fn error_response(status: StatusCode, errors: Vec<String>) -> Response {
    (status, Json(ErrorBody::new(errors))).into_response()
}
