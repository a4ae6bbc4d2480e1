//! Wire model for captured HTTP exchanges.
//!
//! Field names are part of the collector contract and are pinned with explicit
//! serde renames; do not rename without coordinating a collector rollout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;

/// One captured request/response exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiCall {
    /// Route template matched by the host (`/users/:id`), not the raw path.
    #[serde(rename = "path")]
    pub api_path: String,
    #[serde(rename = "method")]
    pub api_method: String,
    #[serde(rename = "reqId")]
    pub request_id: String,
    /// Wall-clock milliseconds since epoch at request start.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    /// Microseconds between create and finalize, measured on a monotonic clock.
    #[serde(rename = "dur")]
    pub duration_us: i64,
    pub finalized: bool,
    #[serde(rename = "req")]
    pub request: RequestSnapshot,
    #[serde(rename = "res")]
    pub response: ResponseSnapshot,
}

impl ApiCall {
    pub fn new(
        api_path: impl Into<String>,
        api_method: impl Into<String>,
        request_id: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            api_path: api_path.into(),
            api_method: api_method.into(),
            request_id: request_id.into(),
            timestamp_ms,
            duration_us: 0,
            finalized: false,
            request: RequestSnapshot::default(),
            response: ResponseSnapshot::default(),
        }
    }

    /// Serialize into the one-record-per-text-frame wire form.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Request side of an exchange, taken before the host handler runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub host: String,
    /// Raw URL path as received, unlike `ApiCall::api_path`.
    pub path: String,
    pub method: String,
    pub protocol: String,
    pub query_params: HashMap<String, Vec<String>>,
    /// Declared content length; -1 when the request did not declare one.
    pub body_size: i64,
    pub body: String,
    pub headers: HashMap<String, Vec<String>>,
    pub form_values: HashMap<String, Vec<String>>,
    pub remote_address: String,
    pub user_agent: String,
    pub cookies: HashMap<String, String>,
    pub referer: String,
    /// Set when the captured body was cut at `max_body_bytes`. Local only,
    /// never sent on the wire.
    #[serde(skip)]
    pub truncated: bool,
}

/// Response side of an exchange, assembled once the host handler returned and
/// the response body finished streaming to the client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub status: u16,
    /// Bytes actually written to the client, counted past the capture cap.
    pub body_size: i64,
    pub headers: HashMap<String, Vec<String>>,
    pub body: String,
    /// Set when the captured body was cut at `max_body_bytes`. Local only,
    /// never sent on the wire.
    #[serde(skip)]
    pub truncated: bool,
}
