// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire types for the local RPC protocol.
//!
//! Each request and each response is one line of UTF-8 JSON terminated by
//! `\n` on the Unix socket. Requests carry `{id, method, params}`; responses
//! carry `{id, result}` or `{id, error: {code, message}}`. Parse failures
//! are answered with `id = 0` since the request ID never decoded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::queue::CallKind;

/// The request line could not be decoded as JSON.
pub const PARSE_ERROR: i64 = -32700;
/// The method name is not one the sidecar serves.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params were missing or failed to decode for the method.
pub const INVALID_PARAMS: i64 = -32602;
/// The pipeline has not been wired yet; `init` must come first.
pub const NOT_INITIALIZED: i64 = -32000;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: u64, result: serde_json::Value) -> Self {
        RpcResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        RpcResponse {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Parameters of `init`. The first `init` wires the pipeline; later calls
/// are idempotent no-ops so any number of clients can connect safely.
#[derive(Debug, Deserialize)]
pub struct InitParams {
    pub server_url: String,
    /// `[username, password]`, typically `["api", <api key>]`. When absent
    /// the sidecar falls back to its own resolved credentials.
    #[serde(default)]
    pub auth: Option<(String, String)>,
    /// Static headers added to every intake request.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub config: Option<PipelineOverrides>,
}

/// Optional per-pipeline tuning supplied at `init` time. Anything left
/// unset keeps the sidecar default.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PipelineOverrides {
    pub max_queue_size: Option<usize>,
    /// `0` means unbounded, matching the queue semantics.
    pub max_batch_size: Option<usize>,
    pub max_batch_bytes: Option<usize>,
    pub max_concurrent_sends: Option<usize>,
    pub max_retries: Option<u32>,
    pub flush_interval_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub max_retry_backoff_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueParams {
    pub items: Vec<EnqueueItem>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueItem {
    #[serde(rename = "type")]
    pub kind: CallKind,
    /// Opaque, already-serialized request body; never re-encoded.
    pub payload: Box<RawValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResult {
    pub sent: u64,
    pub failed: u64,
    /// Entries currently between "left the queue" and "send terminated".
    pub pending: u64,
    pub dropped: u64,
    pub queue_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decodes_with_raw_params() {
        let line = r#"{"id":7,"method":"enqueue","params":{"items":[{"type":"start","payload":{ "a" : 1 }}]}}"#;
        let req: RpcRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.method, "enqueue");
        let params: EnqueueParams = serde_json::from_str(req.params.unwrap().get()).unwrap();
        assert_eq!(params.items.len(), 1);
        assert_eq!(params.items[0].kind, CallKind::Start);
        // Raw payload bytes preserved, including interior spacing.
        assert_eq!(params.items[0].payload.get(), r#"{ "a" : 1 }"#);
    }

    #[test]
    fn test_request_id_defaults_to_zero() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"stats"}"#).unwrap();
        assert_eq!(req.id, 0);
        assert!(req.params.is_none());
    }

    #[test]
    fn test_result_envelope_omits_error() {
        let resp = RpcResponse::result(3, serde_json::json!({"ok": true}));
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(line, r#"{"id":3,"result":{"ok":true}}"#);
    }

    #[test]
    fn test_error_envelope_omits_result() {
        let resp = RpcResponse::error(0, PARSE_ERROR, "parse error");
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"id":0,"error":{"code":-32700,"message":"parse error"}}"#
        );
    }

    #[test]
    fn test_init_params_auth_is_pair() {
        let params: InitParams = serde_json::from_str(
            r#"{"server_url":"https://trace.example.com","auth":["api","secret"]}"#,
        )
        .unwrap();
        assert_eq!(params.server_url, "https://trace.example.com");
        assert_eq!(params.auth, Some(("api".to_string(), "secret".to_string())));
        assert!(params.headers.is_none());
        assert!(params.config.is_none());
    }

    #[test]
    fn test_init_params_config_overrides() {
        let params: InitParams = serde_json::from_str(
            r#"{"server_url":"http://x","config":{"max_batch_bytes":1024,"max_retries":0}}"#,
        )
        .unwrap();
        let overrides = params.config.unwrap();
        assert_eq!(overrides.max_batch_bytes, Some(1024));
        assert_eq!(overrides.max_retries, Some(0));
        assert!(overrides.flush_interval_ms.is_none());
    }
}
