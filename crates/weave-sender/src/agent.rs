// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle: wires the pipeline to the RPC server and owns shutdown.
//!
//! Startup order: resolve credentials, bind the socket, optionally start
//! the pipeline (sidecar-direct mode), start accepting. Shutdown order:
//! stop accepting and release the listener, drain the batcher under the
//! shutdown timeout, force-close surviving connections, unlink the socket.
//! Either a process signal or an RPC `shutdown` enters the same sequence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batcher::Batcher;
use crate::config::{Config, PipelineConfig};
use crate::error::AgentError;
use crate::queue::TraceQueue;
use crate::sender::{HttpTraceSender, SenderBuildError, SenderConfig, TraceSender};
use crate::server::{RpcServer, ServerState};
use crate::uds;

/// One wired queue → batcher → sender chain.
pub struct Pipeline {
    pub queue: Arc<TraceQueue>,
    pub batcher: Batcher,
}

impl Pipeline {
    /// Builds the chain and starts the batcher driver.
    pub fn start(
        server_url: &str,
        api_key: Option<String>,
        extra_headers: HashMap<String, String>,
        config: PipelineConfig,
    ) -> Result<Arc<Pipeline>, SenderBuildError> {
        let sender = HttpTraceSender::new(SenderConfig {
            server_url: server_url.to_string(),
            api_key,
            extra_headers,
            request_timeout: config.request_timeout,
            max_concurrent_sends: config.max_concurrent_sends,
        })?;
        let sender: Arc<dyn TraceSender> = Arc::new(sender);

        let queue = Arc::new(TraceQueue::new(config.max_queue_size));
        let batcher = Batcher::new(Arc::clone(&queue), sender, config);
        batcher.start();
        info!("pipeline started for {server_url}");

        Ok(Arc::new(Pipeline { queue, batcher }))
    }
}

/// The sidecar process: one socket, one optional pipeline, one shutdown.
pub struct SenderAgent {
    config: Arc<Config>,
}

impl SenderAgent {
    pub fn new(config: Config) -> Self {
        SenderAgent {
            config: Arc::new(config),
        }
    }

    /// Runs until a signal or an RPC `shutdown` stops the process.
    pub async fn run(&self) -> Result<(), AgentError> {
        let api_key = crate::api_key::resolve_api_key(self.config.api_key.as_deref());
        if api_key.is_none() {
            warn!("no API key found (flag, WANDB_API_KEY, or netrc); the backend may reject traffic");
        }

        // Sidecar-direct mode: a backend URL on the command line starts the
        // pipeline immediately instead of waiting for `init`.
        let pipeline = match &self.config.server_url {
            Some(url) => Some(
                Pipeline::start(
                    url,
                    api_key.clone(),
                    HashMap::new(),
                    self.config.pipeline.clone(),
                )
                .map_err(|e| AgentError::Config(e.to_string()))?,
            ),
            None => None,
        };

        let (listener, socket_guard) =
            uds::bind_socket(&self.config.socket_path, self.config.socket_permissions)
                .map_err(AgentError::Bind)?;
        info!("listening on {}", self.config.socket_path.display());

        let shutdown = CancellationToken::new();
        let accept_cancel = CancellationToken::new();
        let conn_cancel = CancellationToken::new();

        let state = ServerState::new(
            Arc::clone(&self.config),
            api_key,
            pipeline,
            shutdown.clone(),
        );
        let server = RpcServer::new(Arc::clone(&state));
        let server_handle = tokio::spawn(server.serve(
            listener,
            accept_cancel.clone(),
            conn_cancel.clone(),
        ));

        wait_for_shutdown(&shutdown).await;
        info!("shutting down");

        // Stop accepting; the accept loop drops the listener right away.
        accept_cancel.cancel();

        // Drain what the pipeline already accepted, bounded by the shutdown
        // timeout so a dead backend cannot wedge the process.
        if let Some(pipeline) = state.pipeline().await {
            let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
                pipeline.batcher.stop().await;
                pipeline.batcher.wait_idle().await;
            })
            .await;
            if drained.is_err() {
                warn!(
                    "final flush did not finish within {:?}, abandoning in-flight batches",
                    self.config.shutdown_timeout
                );
            }
        }

        // Now force-close connections still blocked in a read and wait for
        // the server task to wind down.
        conn_cancel.cancel();
        match server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AgentError::Listener(e)),
            Err(e) => error!("server task failed: {e}"),
        }

        // Unlink the socket inode last.
        drop(socket_guard);
        info!("shutdown complete");
        Ok(())
    }
}

/// Resolves when SIGINT or SIGTERM arrives or the RPC layer cancels the
/// token. Signal handler registration failures are logged, not fatal —
/// the RPC shutdown path still works without them.
async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            error!("failed to install SIGINT handler: {e}");
            None
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            None
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = async {
            match sigint.as_mut() {
                Some(sig) => { sig.recv().await; }
                None => std::future::pending().await,
            }
        } => {
            info!("received SIGINT");
            shutdown.cancel();
        }
        _ = async {
            match sigterm.as_mut() {
                Some(sig) => { sig.recv().await; }
                None => std::future::pending().await,
            }
        } => {
            info!("received SIGTERM");
            shutdown.cancel();
        }
    }
}
