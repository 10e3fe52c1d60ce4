// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Test helpers: a line-oriented RPC client and an in-process sidecar.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use weave_sender::agent::SenderAgent;
use weave_sender::config::Config;

/// Minimal client speaking the line-delimited RPC protocol.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(RpcClient {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 1,
        })
    }

    /// Sends one request and reads one response line.
    pub async fn call(&mut self, method: &str, params: Option<Value>) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = serde_json::json!({"id": id, "method": method});
        if let Some(params) = params {
            request["params"] = params;
        }
        let response = self.send_line(&request.to_string()).await;
        assert_eq!(response["id"], id, "response id should echo the request");
        response
    }

    /// Sends a raw line (possibly malformed) and reads one response line.
    pub async fn send_line(&mut self, line: &str) -> Value {
        let mut out = line.as_bytes().to_vec();
        out.push(b'\n');
        self.writer.write_all(&out).await.expect("write failed");

        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .await
            .expect("read failed");
        assert!(read > 0, "server closed the connection");
        serde_json::from_str(&response).expect("response was not valid JSON")
    }
}

/// Spawns a sidecar on a fresh socket under the given temp dir. The agent
/// runs until `shutdown` is called over RPC or the handle is aborted;
/// either way the socket guard unlinks the socket file.
pub async fn spawn_agent(dir: &Path, config: Config) -> (JoinHandle<()>, PathBuf) {
    let socket_path = dir.join("weave-sender.sock");
    let config = Config {
        socket_path: socket_path.clone(),
        ..config
    };

    let handle = tokio::spawn(async move {
        let agent = SenderAgent::new(config);
        if let Err(e) = agent.run().await {
            panic!("agent exited with error: {e}");
        }
    });

    wait_for_socket(&socket_path).await;
    (handle, socket_path)
}

/// Polls until the socket accepts connections.
pub async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sidecar socket {} never came up", path.display());
}
