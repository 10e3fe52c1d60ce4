// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Fatal sidecar errors. Everything here ends the process with a non-zero
/// exit code; per-batch and per-connection failures are handled (and
/// counted) inside the pipeline instead.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),

    #[error("listener error: {0}")]
    Listener(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
