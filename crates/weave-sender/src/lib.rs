// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # weave-sender
//!
//! A local telemetry sidecar: co-located client processes hand trace call
//! events (`start` / `end`) to this process over a Unix-domain socket; the
//! sidecar buffers them in a bounded in-memory queue, carves the queue into
//! size- and time-bounded batches, and ships each batch as one
//! `POST /call/upsert_batch` request to a remote trace-ingest endpoint with
//! bounded concurrency and bounded retries.
//!
//! The pipeline is best-effort by design: producers are never blocked on the
//! remote, enqueue overflow is counted rather than raised, and entries whose
//! batch fails terminally are discarded. Durability is out of scope — items
//! in flight at process death are lost.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod api_key;
pub mod batcher;
pub mod config;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod sender;
pub mod server;
pub mod uds;
