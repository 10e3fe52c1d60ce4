// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use weave_sender::agent::SenderAgent;
use weave_sender::config::{self, Config};

#[derive(Debug, Parser)]
#[command(
    name = "weave-sender",
    about = "Local sidecar that batches trace call events and ships them to a trace-ingest endpoint"
)]
struct Cli {
    /// Unix socket path to listen on.
    #[arg(long, default_value_os_t = config::default_socket_path())]
    socket: PathBuf,

    /// Log at debug level.
    #[arg(long)]
    verbose: bool,

    /// Trace-ingest base URL. When given, the pipeline starts at boot
    /// instead of waiting for the first `init` call.
    #[arg(long)]
    backend: Option<String>,

    /// API key. Falls back to WANDB_API_KEY, then the netrc entry for
    /// api.wandb.ai.
    #[arg(long)]
    api_key: Option<String>,

    /// How often the batcher drains the queue (e.g. "1s", "500ms").
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    flush_interval: Duration,

    /// Maximum items per batch; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    flush_max_count: usize,

    /// Maximum serialized payload bytes per batch.
    #[arg(long, default_value_t = config::DEFAULT_MAX_BATCH_BYTES)]
    flush_max_bytes: usize,

    /// Per-attempt timeout for intake requests.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    request_timeout: Duration,

    /// Octal permission bits for the socket file. 600 keeps it private to
    /// this user; 666 allows any local process to connect.
    #[arg(long, value_parser = parse_octal_mode, default_value = "600")]
    socket_permissions: u32,

    /// How long the final drain may run after shutdown begins.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    shutdown_timeout: Duration,
}

fn parse_octal_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8).map_err(|e| format!("not an octal mode: {e}"))
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config {
            socket_path: self.socket,
            socket_permissions: self.socket_permissions,
            verbose: self.verbose,
            server_url: self.backend,
            api_key: self.api_key,
            shutdown_timeout: self.shutdown_timeout,
            ..Config::default()
        };
        config.pipeline.flush_interval = self.flush_interval;
        config.pipeline.max_batch_size = match self.flush_max_count {
            0 => None,
            n => Some(n),
        };
        config.pipeline.max_batch_bytes = self.flush_max_bytes;
        config.pipeline.request_timeout = self.request_timeout;
        config
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = format!("h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{level}");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let agent = SenderAgent::new(cli.into_config());
    if let Err(e) = agent.run().await {
        error!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["weave-sender"]);
        assert!(!cli.verbose);
        assert!(cli.backend.is_none());
        assert_eq!(cli.flush_interval, Duration::from_secs(1));
        assert_eq!(cli.flush_max_count, 0);
        assert_eq!(cli.socket_permissions, 0o600);
        assert!(cli.socket.ends_with("weave-sender.sock"));
    }

    #[test]
    fn test_cli_sidecar_direct_flags() {
        let cli = Cli::parse_from([
            "weave-sender",
            "--backend",
            "https://trace.wandb.ai",
            "--api-key",
            "k",
            "--flush-interval",
            "250ms",
            "--flush-max-count",
            "1000",
            "--flush-max-bytes",
            "1048576",
            "--socket-permissions",
            "666",
        ]);
        let config = cli.into_config();
        assert_eq!(config.server_url.as_deref(), Some("https://trace.wandb.ai"));
        assert_eq!(config.pipeline.flush_interval, Duration::from_millis(250));
        assert_eq!(config.pipeline.max_batch_size, Some(1000));
        assert_eq!(config.pipeline.max_batch_bytes, 1024 * 1024);
        assert_eq!(config.socket_permissions, 0o666);
    }

    #[test]
    fn test_octal_mode_parser() {
        assert_eq!(parse_octal_mode("600").unwrap(), 0o600);
        assert_eq!(parse_octal_mode("666").unwrap(), 0o666);
        assert!(parse_octal_mode("9x").is_err());
    }
}
