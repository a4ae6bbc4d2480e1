//! axum interceptor.
//!
//! Install once per router with
//! `axum::middleware::from_fn_with_state(tap.state(), apitap::intercept)`.
//! Every capture step is best-effort: a failure is logged and the host
//! request proceeds untouched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, REFERER, USER_AGENT};
use http::request::Parts;
use tracing::warn;
use url::form_urlencoded;
use uuid::Uuid;

use crate::capture::{CaptureBody, snapshot_text};
use crate::record::{RequestSnapshot, ResponseSnapshot};
use crate::tap::TapState;

/// Correlation id minted for the current request, readable by downstream
/// handlers via `Extension<RequestId>`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn intercept(State(state): State<TapState>, request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let (parts, body) = request.into_parts();
    let api_path = parts
        .extensions
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let api_method = parts.method.as_str().to_string();

    // Buffer the request body so the exact bytes can be replayed to the
    // handler; only the snapshot copy is capped.
    let body_bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(request_id, error = %err, "failed to read request body");
            Bytes::new()
        }
    };
    let snapshot = snapshot_request(&parts, &body_bytes, state.config());
    state
        .cache()
        .create(&request_id, &api_path, &api_method, snapshot);

    let mut parts = parts;
    parts.extensions.insert(RequestId(request_id.clone()));
    let request = Request::from_parts(parts, Body::from(body_bytes));

    let response = next.run(request).await;

    observe_response(response, request_id, &state)
}

/// Swap the response body for a tee that finalizes the record once the body
/// has streamed to the client. Status and headers are final here; size, body
/// text, and truncation come from the tee.
fn observe_response(response: Response, request_id: String, state: &TapState) -> Response {
    let (parts, body) = response.into_parts();
    let status = parts.status.as_u16();
    let headers = header_values(&parts.headers);

    let cache = Arc::clone(state.cache());
    let queue = state.queue().clone();
    let capture = CaptureBody::new(body, state.config().max_body_bytes, move |captured| {
        let snapshot = ResponseSnapshot {
            status,
            body_size: captured.bytes_forwarded as i64,
            headers,
            body: String::from_utf8_lossy(&captured.body).into_owned(),
            truncated: captured.truncated,
        };
        if let Some(call) = cache.finalize(&request_id, snapshot) {
            queue.push(call);
        }
    });

    Response::from_parts(parts, Body::new(capture))
}

fn snapshot_request(parts: &Parts, body_bytes: &Bytes, config: &crate::TapConfig) -> RequestSnapshot {
    let (body, truncated) = snapshot_text(body_bytes, config.max_body_bytes);
    RequestSnapshot {
        host: header_str(&parts.headers, HOST.as_str())
            .or_else(|| parts.uri.host().map(str::to_string))
            .unwrap_or_default(),
        path: parts.uri.path().to_string(),
        method: parts.method.as_str().to_string(),
        protocol: format!("{:?}", parts.version),
        query_params: parse_pairs(parts.uri.query().unwrap_or_default()),
        body_size: header_str(&parts.headers, CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse().ok())
            .unwrap_or(-1),
        body,
        headers: header_values(&parts.headers),
        form_values: form_values(&parts.headers, body_bytes),
        remote_address: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default(),
        user_agent: header_str(&parts.headers, USER_AGENT.as_str()).unwrap_or_default(),
        cookies: cookies(&parts.headers),
        referer: header_str(&parts.headers, REFERER.as_str()).unwrap_or_default(),
        truncated,
    }
}

fn header_values(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn parse_pairs(encoded: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in form_urlencoded::parse(encoded.as_bytes()) {
        out.entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    out
}

fn form_values(headers: &HeaderMap, body: &[u8]) -> HashMap<String, Vec<String>> {
    let urlencoded = header_str(headers, CONTENT_TYPE.as_str())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if !urlencoded || body.is_empty() {
        return HashMap::new();
    }
    parse_pairs(&String::from_utf8_lossy(body))
}

fn cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                out.insert(name.to_string(), value.to_string());
            }
        }
    }
    out
}
