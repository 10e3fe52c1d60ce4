// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sidecar configuration and pipeline tuning.
//!
//! Everything is resolved once at startup (flags and environment) except
//! the per-pipeline limits, which `init` may override per §`protocol`.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::PipelineOverrides;
use crate::queue::DEFAULT_MAX_QUEUE_ITEMS;

/// Maximum serialized batch size in bytes.
///
/// The trace-ingest API rejects request bodies over 32 MiB; keep 1 MiB of
/// headroom for the envelope and framing.
pub const DEFAULT_MAX_BATCH_BYTES: usize = (32 - 1) * 1024 * 1024;

/// How many batches may be in flight to the intake endpoint at once.
pub const DEFAULT_MAX_CONCURRENT_SENDS: usize = 4;

/// Retries after the first attempt, so up to four total sends per batch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the final drain may run once shutdown begins.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle HTTP connections to the intake are kept warm this long.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Socket file name used when no `--socket` flag is given.
pub const DEFAULT_SOCKET_NAME: &str = "weave-sender.sock";

/// Process-wide sidecar configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket path the RPC server listens on.
    pub socket_path: PathBuf,
    /// Octal mode applied to the socket file after bind. `0o600` keeps the
    /// socket private to the owning user; pass `0o666` for shared access.
    pub socket_permissions: u32,
    pub verbose: bool,
    /// When set, the pipeline starts at boot against this backend instead of
    /// waiting for an `init` call.
    pub server_url: Option<String>,
    /// Resolved API key, if any. Missing keys are tolerated; the backend
    /// rejects unauthenticated traffic itself.
    pub api_key: Option<String>,
    pub pipeline: PipelineConfig,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: default_socket_path(),
            socket_permissions: 0o600,
            verbose: false,
            server_url: None,
            api_key: None,
            pipeline: PipelineConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Tuning for one queue/batcher/sender pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_queue_size: usize,
    /// Item-count cap per batch. `None` means unbounded; the byte limit is
    /// the operative bound in that case.
    pub max_batch_size: Option<usize>,
    pub max_batch_bytes: usize,
    pub max_concurrent_sends: usize,
    pub max_retries: u32,
    pub flush_interval: Duration,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_ITEMS,
            max_batch_size: None,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            max_retries: DEFAULT_MAX_RETRIES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    /// Applies `init`-time overrides on top of this configuration.
    pub fn with_overrides(&self, overrides: &PipelineOverrides) -> PipelineConfig {
        let mut config = self.clone();
        if let Some(n) = overrides.max_queue_size {
            config.max_queue_size = n;
        }
        if let Some(n) = overrides.max_batch_size {
            // Zero on the wire means unbounded.
            config.max_batch_size = if n == 0 { None } else { Some(n) };
        }
        if let Some(n) = overrides.max_batch_bytes {
            config.max_batch_bytes = n;
        }
        if let Some(n) = overrides.max_concurrent_sends {
            config.max_concurrent_sends = n.max(1);
        }
        if let Some(n) = overrides.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = overrides.flush_interval_ms {
            config.flush_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = overrides.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.max_retry_backoff_ms {
            config.max_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        config
    }
}

pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET_NAME)
}
