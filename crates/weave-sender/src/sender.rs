// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery of batches to the trace-ingest endpoint.
//!
//! One batch becomes one `POST {base_url}/call/upsert_batch` request with
//! the body `{"batch":[{"mode":"start"|"end","req":<raw payload>}, ...]}`.
//! Payloads are forwarded byte-for-byte; the sidecar never re-encodes them.
//!
//! Failures are classified for the retry loop in the batcher: server-side
//! trouble (5xx, 429) and transport errors are worth retrying, everything
//! else is terminal.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::debug;

use crate::config::POOL_IDLE_TIMEOUT;
use crate::queue::{CallKind, QueueEntry};

const UPSERT_BATCH_PATH: &str = "/call/upsert_batch";

/// Basic-auth username the trace-ingest API expects alongside an API key.
const AUTH_USERNAME: &str = "api";

/// Cap on how much of an error response body is retained for logging.
const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("failed to encode batch: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SendError {
    /// Whether the batcher should try this batch again.
    ///
    /// Server-side failures (5xx) and throttling (429) are transient; other
    /// client errors mean the payload will never be accepted. Transport
    /// failures (refused connections, TLS trouble, request timeouts) are
    /// transient. Encode failures are terminal. Cancellation never reaches
    /// this classification; the dispatcher cuts the in-flight future short
    /// instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Http { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            SendError::Transport(_) => true,
            SendError::Payload(_) => false,
        }
    }
}

/// Errors building the sender itself (bad URL, bad header values).
#[derive(Debug, Error)]
pub enum SenderBuildError {
    #[error("invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid static header {name:?}")]
    InvalidHeader { name: String },
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Delivery seam between the batcher and the network, mockable in tests.
#[async_trait]
pub trait TraceSender: Send + Sync {
    async fn send_batch(&self, batch: &[QueueEntry]) -> Result<(), SendError>;
}

#[derive(Serialize)]
struct UpsertBatch<'a> {
    batch: Vec<BatchItem<'a>>,
}

#[derive(Serialize)]
struct BatchItem<'a> {
    mode: CallKind,
    req: &'a RawValue,
}

/// Settings the sender needs from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub server_url: String,
    pub api_key: Option<String>,
    pub extra_headers: HashMap<String, String>,
    pub request_timeout: Duration,
    pub max_concurrent_sends: usize,
}

/// Sends batches to the trace-ingest endpoint over HTTPS with a pooled
/// client sized to the dispatcher's concurrency cap.
pub struct HttpTraceSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    headers: HeaderMap,
}

impl HttpTraceSender {
    pub fn new(config: SenderConfig) -> Result<Self, SenderBuildError> {
        let base = config.server_url.trim_end_matches('/');
        let endpoint = format!("{base}{UPSERT_BATCH_PATH}");
        reqwest::Url::parse(&endpoint).map_err(|e| SenderBuildError::InvalidUrl {
            url: config.server_url.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.extra_headers {
            let name: HeaderName =
                name.parse()
                    .map_err(|_| SenderBuildError::InvalidHeader { name: name.clone() })?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| SenderBuildError::InvalidHeader { name: name.to_string() })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_concurrent_sends)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(SenderBuildError::Client)?;

        Ok(HttpTraceSender {
            client,
            endpoint,
            api_key: config.api_key,
            headers,
        })
    }

    fn encode(batch: &[QueueEntry]) -> Result<Vec<u8>, serde_json::Error> {
        let body = UpsertBatch {
            batch: batch
                .iter()
                .map(|entry| BatchItem {
                    mode: entry.kind,
                    req: &entry.payload,
                })
                .collect(),
        };
        serde_json::to_vec(&body)
    }
}

#[async_trait]
impl TraceSender for HttpTraceSender {
    async fn send_batch(&self, batch: &[QueueEntry]) -> Result<(), SendError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = Self::encode(batch)?;
        let mut request = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body);
        if let Some(api_key) = &self.api_key {
            request = request.basic_auth(AUTH_USERNAME, Some(api_key));
        }

        let response = request.send().await.map_err(SendError::Transport)?;
        let status = response.status();
        if status.is_success() {
            debug!("shipped batch of {} entries", batch.len());
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        body.truncate(ERROR_BODY_LIMIT);
        Err(SendError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TraceQueue;

    fn entry(kind: CallKind, json: &str) -> QueueEntry {
        let queue = TraceQueue::default();
        queue.enqueue(vec![(kind, RawValue::from_string(json.to_string()).unwrap())]);
        queue.dequeue(1).pop().unwrap()
    }

    #[test]
    fn test_envelope_passes_payload_through() {
        let batch = vec![
            entry(CallKind::Start, r#"{"a":1}"#),
            entry(CallKind::End, r#"{"a":2}"#),
        ];
        let body = HttpTraceSender::encode(&batch).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"batch":[{"mode":"start","req":{"a":1}},{"mode":"end","req":{"a":2}}]}"#
        );
    }

    #[test]
    fn test_envelope_preserves_payload_bytes_exactly() {
        // Key order and interior whitespace are the client's business.
        let odd = r#"{ "z" : 1, "a" :  [2,1] }"#;
        let batch = vec![entry(CallKind::Start, odd)];
        let body = String::from_utf8(HttpTraceSender::encode(&batch).unwrap()).unwrap();
        assert!(body.contains(odd), "body {body:?} should embed {odd:?}");
    }

    #[tokio::test]
    async fn test_empty_batch_is_success_without_io() {
        // Unroutable endpoint: any request attempt would error.
        let sender = HttpTraceSender::new(SenderConfig {
            server_url: "http://127.0.0.1:1".to_string(),
            api_key: None,
            extra_headers: HashMap::new(),
            request_timeout: Duration::from_millis(100),
            max_concurrent_sends: 1,
        })
        .unwrap();
        assert!(sender.send_batch(&[]).await.is_ok());
    }

    #[test]
    fn test_retryable_classification() {
        let http = |status| SendError::Http {
            status,
            body: String::new(),
        };
        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(404).is_retryable());
        assert!(!http(413).is_retryable());
    }

    #[test]
    fn test_rejects_invalid_url() {
        let result = HttpTraceSender::new(SenderConfig {
            server_url: "not a url".to_string(),
            api_key: None,
            extra_headers: HashMap::new(),
            request_timeout: Duration::from_secs(1),
            max_concurrent_sends: 1,
        });
        assert!(matches!(result, Err(SenderBuildError::InvalidUrl { .. })));
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let mut extra_headers = HashMap::new();
        extra_headers.insert("bad header\n".to_string(), "x".to_string());
        let result = HttpTraceSender::new(SenderConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            extra_headers,
            request_timeout: Duration::from_secs(1),
            max_concurrent_sends: 1,
        });
        assert!(matches!(result, Err(SenderBuildError::InvalidHeader { .. })));
    }
}
