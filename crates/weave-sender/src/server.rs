// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-delimited RPC over the Unix socket.
//!
//! Each connection carries a strictly sequential stream of requests: read
//! one line, dispatch, write one response line, repeat. A request line that
//! fails to decode gets a parse-error envelope and the connection lives on;
//! clean EOF ends the connection. The accept loop and every connection task
//! watch cancellation tokens so shutdown can first stop accepting and later
//! force-close connections that are blocked in a read.

use std::io;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent::Pipeline;
use crate::config::Config;
use crate::protocol::{
    EnqueueParams, InitParams, RpcRequest, RpcResponse, StatsResult, INVALID_PARAMS,
    METHOD_NOT_FOUND, NOT_INITIALIZED, PARSE_ERROR,
};

/// Delay between answering `shutdown` and triggering it, so the response
/// line reaches the client before the process starts tearing down.
const SHUTDOWN_RESPONSE_GRACE: Duration = Duration::from_millis(100);

/// Shared state behind every connection: the lazily-initialized pipeline
/// and the process shutdown trigger.
pub struct ServerState {
    config: Arc<Config>,
    api_key: Option<String>,
    pipeline: tokio::sync::Mutex<Option<Arc<Pipeline>>>,
    shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        config: Arc<Config>,
        api_key: Option<String>,
        pipeline: Option<Arc<Pipeline>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ServerState {
            config,
            api_key,
            pipeline: tokio::sync::Mutex::new(pipeline),
            shutdown,
        })
    }

    pub async fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().await.clone()
    }

    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        match request.method.as_str() {
            "init" => self.handle_init(request).await,
            "enqueue" => self.handle_enqueue(request).await,
            "flush" => self.handle_flush(id).await,
            "stats" => self.handle_stats(id).await,
            "shutdown" => self.handle_shutdown(id),
            method => RpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("unknown method {method:?}"),
            ),
        }
    }

    /// First `init` wires queue, sender, and batcher and starts the driver;
    /// every later `init` is a success no-op so concurrent clients can all
    /// initialize without coordination.
    async fn handle_init(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        let params: InitParams = match parse_params(request) {
            Ok(params) => params,
            Err(resp) => return resp,
        };

        let mut pipeline = self.pipeline.lock().await;
        if pipeline.is_some() {
            return RpcResponse::result(id, json!({"ok": true}));
        }

        let api_key = params
            .auth
            .as_ref()
            .map(|(_, password)| password.clone())
            .or_else(|| self.api_key.clone());
        let pipeline_config = match &params.config {
            Some(overrides) => self.config.pipeline.with_overrides(overrides),
            None => self.config.pipeline.clone(),
        };

        match Pipeline::start(
            &params.server_url,
            api_key,
            params.headers.unwrap_or_default(),
            pipeline_config,
        ) {
            Ok(started) => {
                *pipeline = Some(started);
                RpcResponse::result(id, json!({"ok": true}))
            }
            Err(e) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        }
    }

    async fn handle_enqueue(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        let Some(pipeline) = self.pipeline().await else {
            return not_initialized(id);
        };
        let params: EnqueueParams = match parse_params(request) {
            Ok(params) => params,
            Err(resp) => return resp,
        };

        let items = params
            .items
            .into_iter()
            .map(|item| (item.kind, item.payload))
            .collect();
        let ids = pipeline.queue.enqueue(items);
        RpcResponse::result(id, json!({ "ids": ids }))
    }

    async fn handle_flush(&self, id: u64) -> RpcResponse {
        let Some(pipeline) = self.pipeline().await else {
            return not_initialized(id);
        };
        pipeline.batcher.flush_all().await;
        RpcResponse::result(id, json!({"ok": true}))
    }

    async fn handle_stats(&self, id: u64) -> RpcResponse {
        let Some(pipeline) = self.pipeline().await else {
            return not_initialized(id);
        };
        let stats = pipeline.batcher.stats();
        let result = StatsResult {
            sent: stats.sent(),
            failed: stats.failed(),
            pending: pipeline.batcher.pending_entries(),
            dropped: pipeline.queue.dropped_count(),
            queue_size: pipeline.queue.len() as u64,
        };
        RpcResponse::result(id, json!(result))
    }

    /// Schedules process shutdown shortly after the response is written.
    /// Idempotent: a second `shutdown` finds the token already cancelled.
    fn handle_shutdown(&self, id: u64) -> RpcResponse {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_RESPONSE_GRACE).await;
            shutdown.cancel();
        });
        RpcResponse::result(id, json!({"ok": true}))
    }
}

fn not_initialized(id: u64) -> RpcResponse {
    RpcResponse::error(id, NOT_INITIALIZED, "not initialized: call init first")
}

fn parse_params<T: serde::de::DeserializeOwned>(request: RpcRequest) -> Result<T, RpcResponse> {
    let raw = request
        .params
        .ok_or_else(|| RpcResponse::error(request.id, INVALID_PARAMS, "missing params"))?;
    serde_json::from_str(raw.get()).map_err(|e| {
        RpcResponse::error(
            request.id,
            INVALID_PARAMS,
            format!("invalid params for {}: {e}", request.method),
        )
    })
}

/// The RPC accept loop.
pub struct RpcServer {
    state: Arc<ServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        RpcServer { state }
    }

    /// Accepts connections until `accept_cancel` fires, then drops the
    /// listener (releasing the socket) and waits for the remaining
    /// connection tasks; those exit on EOF or when `conn_cancel` fires.
    pub async fn serve(
        self,
        listener: UnixListener,
        accept_cancel: CancellationToken,
        conn_cancel: CancellationToken,
    ) -> io::Result<()> {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) if is_transient_accept_error(&e) => continue,
                        Err(e) => {
                            error!("accept failed: {e}");
                            return Err(e);
                        }
                    };
                    let state = Arc::clone(&self.state);
                    let cancel = conn_cancel.child_token();
                    connections.spawn(async move {
                        handle_connection(stream, state, cancel).await;
                    });
                }
                finished = connections.join_next(), if !connections.is_empty() => {
                    if let Some(Err(e)) = finished {
                        if e.is_panic() {
                            // One bad connection must not take the server down.
                            error!("connection handler panicked: {e}");
                        }
                    }
                }
            }
        }

        // Stop accepting and release the socket before draining clients.
        drop(listener);
        debug!("listener closed, {} connections draining", connections.len());
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// One request/response loop. Returns on clean EOF, I/O failure, or
/// cancellation; decode failures answer an error envelope and continue.
async fn handle_connection(stream: UnixStream, state: Arc<ServerState>, cancel: CancellationToken) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("connection read failed: {e}");
                return;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(trimmed) {
            Ok(request) => state.dispatch(request).await,
            // The request ID never decoded; the protocol reserves 0 here.
            Err(e) => RpcResponse::error(0, PARSE_ERROR, format!("parse error: {e}")),
        };

        let mut out = match serde_json::to_vec(&response) {
            Ok(out) => out,
            Err(e) => {
                error!("failed to encode response: {e}");
                return;
            }
        };
        out.push(b'\n');
        if let Err(e) = write_half.write_all(&out).await {
            debug!("connection write failed: {e}");
            return;
        }
    }
}
