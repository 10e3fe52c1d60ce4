// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory buffering for trace call events.
//!
//! The queue is the hand-off point between the RPC server and the batcher:
//! the server appends entries as clients enqueue them, the batcher drains
//! them in FIFO order. Capacity is bounded; when full, new entries are
//! dropped and counted rather than blocking the producer or raising an
//! error. Entry IDs are strictly increasing for the lifetime of the process.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::warn;

/// Maximum number of entries that can be queued before new entries are
/// dropped. With typical call payloads of ~1KB this bounds buffered memory
/// to roughly 100MB.
pub const DEFAULT_MAX_QUEUE_ITEMS: usize = 100_000;

/// The kind of call event an entry carries. Forwarded verbatim to the
/// intake endpoint as the `mode` field of each batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Start,
    End,
}

/// One buffered call event.
///
/// The payload is the client's request body, kept as raw JSON so the bytes
/// that reach the intake endpoint are exactly the bytes the client sent.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Strictly increasing within the process, starting at 1.
    pub id: u64,
    pub kind: CallKind,
    pub payload: Box<RawValue>,
    /// Nanosecond wall-clock at enqueue.
    pub timestamp_ns: u64,
}

impl QueueEntry {
    /// Serialized payload size in bytes, used for batch byte accounting.
    pub fn payload_len(&self) -> usize {
        self.payload.get().len()
    }
}

struct Inner {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
    dropped: u64,
}

/// FIFO queue of call events with drop-on-overflow semantics.
///
/// All operations are `&self` and thread-safe; the mutex is never held
/// across an await point.
pub struct TraceQueue {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl Default for TraceQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_ITEMS)
    }
}

impl TraceQueue {
    pub fn new(max_size: usize) -> Self {
        TraceQueue {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
                dropped: 0,
            }),
            max_size,
        }
    }

    /// Appends the given items, stamping each with the current wall-clock
    /// and the next entry ID. Returns the IDs of accepted items in input
    /// order. Items that would push the queue past capacity are dropped and
    /// counted; they contribute no ID. An empty input is a no-op.
    pub fn enqueue(&self, items: Vec<(CallKind, Box<RawValue>)>) -> Vec<u64> {
        if items.is_empty() {
            return Vec::new();
        }
        let mut ids = Vec::with_capacity(items.len());
        let mut dropped_now = 0u64;
        let mut inner = self.lock();
        for (kind, payload) in items {
            if inner.entries.len() >= self.max_size {
                inner.dropped += 1;
                dropped_now += 1;
                continue;
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push_back(QueueEntry {
                id,
                kind,
                payload,
                timestamp_ns: wall_clock_ns(),
            });
            ids.push(id);
        }
        drop(inner);
        if dropped_now > 0 {
            warn!(
                "trace queue full ({} items), dropped {} incoming entries",
                self.max_size, dropped_now
            );
        }
        ids
    }

    /// Returns up to `limit` entries from the front without removing them.
    /// `None` means all.
    pub fn peek(&self, limit: Option<usize>) -> Vec<QueueEntry> {
        let inner = self.lock();
        let n = limit.unwrap_or(inner.entries.len()).min(inner.entries.len());
        inner.entries.iter().take(n).cloned().collect()
    }

    /// Removes and returns up to `n` entries from the front.
    pub fn dequeue(&self, n: usize) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        let n = n.min(inner.entries.len());
        inner.entries.drain(..n).collect()
    }

    /// Prepends entries, preserving their order. Supports retry strategies
    /// that return a batch to the queue; the default dispatcher discards
    /// terminally failed batches instead.
    pub fn requeue(&self, entries: Vec<QueueEntry>) {
        let mut inner = self.lock();
        for entry in entries.into_iter().rev() {
            inner.entries.push_front(entry);
        }
    }

    /// Removes and returns the next batch: a front prefix bounded by
    /// `max_items` (when set) and by the accumulated payload bytes. A batch
    /// never exceeds `max_bytes` unless it holds exactly one entry whose own
    /// payload is already over the limit — that entry ships alone and the
    /// server decides.
    pub fn next_batch(&self, max_items: Option<usize>, max_bytes: usize) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        while let Some(entry) = inner.entries.pop_front() {
            if let Some(max) = max_items {
                if batch.len() >= max {
                    inner.entries.push_front(entry);
                    break;
                }
            }
            let entry_bytes = entry.payload_len();
            if !batch.is_empty() && batch_bytes + entry_bytes > max_bytes {
                // Doesn't fit; put it back for the next batch.
                inner.entries.push_front(entry);
                break;
            }
            if batch.is_empty() && entry_bytes > max_bytes {
                warn!(
                    "queued payload of {} bytes exceeds the {} byte batch limit, sending alone",
                    entry_bytes, max_bytes
                );
            }
            batch_bytes += entry_bytes;
            batch.push(entry);
        }

        batch
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries rejected at enqueue because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means another enqueue/dequeue panicked while
        // holding the lock; the entry list is still structurally valid.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
