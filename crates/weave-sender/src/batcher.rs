// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching and dispatch: the heart of the pipeline.
//!
//! A single driver task drains the queue on a periodic tick. Each flush
//! pass carves the queue into size-bounded batches and dispatches them in
//! parallel, capped by a counting semaphore so at most
//! `max_concurrent_sends` requests are on the wire at any instant. Each
//! batch runs its own retry loop with exponential backoff; terminal
//! failures discard the batch's entries — availability over durability.
//!
//! `flush_all` runs a flush pass synchronously on the caller's task so that
//! every entry present at call entry has reached a terminal outcome when it
//! returns. `wait_idle` blocks until nothing is queued or in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::queue::{QueueEntry, TraceQueue};
use crate::sender::{SendError, TraceSender};

/// Monotonic delivery counters, readable without locking.
#[derive(Debug, Default)]
pub struct PipelineStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl PipelineStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record_sent(&self, entries: u64) {
        self.sent.fetch_add(entries, Ordering::Relaxed);
    }

    fn record_failed(&self, entries: u64) {
        self.failed.fetch_add(entries, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatcherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

enum BatchOutcome {
    Sent,
    Failed(SendError),
    Cancelled,
}

/// Everything the driver and the per-batch send tasks share.
struct Shared {
    queue: Arc<TraceQueue>,
    sender: Arc<dyn TraceSender>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    /// Batches between "left the queue" and "send terminated".
    in_flight_batches: AtomicU64,
    /// Entries inside those batches; reported as `pending`.
    in_flight_entries: AtomicU64,
    idle: Notify,
    /// Long-lived semaphore: the concurrency cap holds globally across the
    /// periodic driver and any concurrent `flush_all` callers.
    send_slots: Semaphore,
    cancel: CancellationToken,
}

impl Shared {
    fn is_idle(&self) -> bool {
        self.in_flight_batches.load(Ordering::Acquire) == 0 && self.queue.is_empty()
    }
}

/// Pulls entries from the queue, assembles bounded batches, and dispatches
/// them through the sender with bounded concurrency and bounded retries.
pub struct Batcher {
    shared: Arc<Shared>,
    state: Mutex<BatcherState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(
        queue: Arc<TraceQueue>,
        sender: Arc<dyn TraceSender>,
        config: PipelineConfig,
    ) -> Batcher {
        let send_slots = Semaphore::new(config.max_concurrent_sends.max(1));
        Batcher {
            shared: Arc::new(Shared {
                queue,
                sender,
                config,
                stats: Arc::new(PipelineStats::default()),
                in_flight_batches: AtomicU64::new(0),
                in_flight_entries: AtomicU64::new(0),
                idle: Notify::new(),
                send_slots,
                cancel: CancellationToken::new(),
            }),
            state: Mutex::new(BatcherState::Created),
            driver: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Entries currently dispatched but not yet terminal.
    pub fn pending_entries(&self) -> u64 {
        self.shared.in_flight_entries.load(Ordering::Acquire)
    }

    /// Starts the periodic driver. Calling `start` on a batcher that is not
    /// freshly created is a no-op.
    pub fn start(&self) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if *state != BatcherState::Created {
                return;
            }
            *state = BatcherState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            // interval() panics on a zero period.
            let period = shared
                .config
                .flush_interval
                .max(std::time::Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh batcher
            // waits one interval before its first pass.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        flush_pass(&shared, &shared.cancel).await;
                    }
                }
            }
            // Final drain: queued entries still get a real delivery attempt.
            // Sends already in flight from earlier passes were cancelled
            // above; the lifecycle bounds this drain with its own timeout.
            flush_pass(&shared, &CancellationToken::new()).await;
            debug!("batcher driver exited");
        });
        *lock_unpoisoned(&self.driver) = Some(handle);
    }

    /// Cancels outstanding sends and retry sleeps, then waits for the driver
    /// to run its final flush pass and exit. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = lock_unpoisoned(&self.state);
            match *state {
                BatcherState::Running => *state = BatcherState::Stopping,
                BatcherState::Created => {
                    *state = BatcherState::Stopped;
                    return;
                }
                BatcherState::Stopping | BatcherState::Stopped => return,
            }
        }
        self.shared.cancel.cancel();
        let handle = lock_unpoisoned(&self.driver).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("batcher driver task failed: {e}");
            }
        }
        *lock_unpoisoned(&self.state) = BatcherState::Stopped;
    }

    /// Runs a flush pass on the caller's task. When this returns, every
    /// entry that was queued at call entry has been shipped or terminally
    /// failed. Callers that need an exact accounting must quiesce their
    /// producers first.
    pub async fn flush_all(&self) {
        flush_pass(&self.shared, &self.shared.cancel).await;
    }

    /// Blocks until the queue is empty and nothing is in flight. Enqueues
    /// are deliberately not a wake-up signal; against an active producer
    /// this only guarantees an idle point was observed after the call.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register the waiter before sampling state: notify_waiters()
            // stores no permit, so a notification landing between the check
            // and the await would otherwise be lost.
            notified.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// One drain-and-dispatch cycle: carve the whole queue into batches,
/// dispatch them in parallel under the semaphore, and wait for every batch
/// dispatched by this pass to terminate.
async fn flush_pass(shared: &Arc<Shared>, cancel: &CancellationToken) {
    let mut batches = Vec::new();
    loop {
        let batch = shared
            .queue
            .next_batch(shared.config.max_batch_size, shared.config.max_batch_bytes);
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }

    if batches.is_empty() {
        if shared.is_idle() {
            shared.idle.notify_waiters();
        }
        return;
    }

    debug!("flush pass dispatching {} batches", batches.len());
    let mut tasks: JoinSet<()> = JoinSet::new();
    for batch in batches {
        shared.in_flight_batches.fetch_add(1, Ordering::AcqRel);
        shared
            .in_flight_entries
            .fetch_add(batch.len() as u64, Ordering::AcqRel);

        let shared = Arc::clone(shared);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            dispatch_and_settle(&shared, batch, &cancel).await;
        });
    }

    // Collect completions; a panic inside a send task must not take the
    // driver down with it.
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("batch send task panicked: {e}");
            }
        }
    }

    if shared.is_idle() {
        shared.idle.notify_waiters();
    }
}

/// Dispatches one batch and settles its accounting. This is the only place
/// a dispatched batch decrements in-flight: exactly once, on any outcome.
async fn dispatch_and_settle(shared: &Shared, batch: Vec<QueueEntry>, cancel: &CancellationToken) {
    let entries = batch.len() as u64;
    match dispatch_with_retries(shared, &batch, cancel).await {
        BatchOutcome::Sent => shared.stats.record_sent(entries),
        BatchOutcome::Failed(e) => {
            warn!("dropping batch of {entries} entries after terminal failure: {e}");
            shared.stats.record_failed(entries);
        }
        BatchOutcome::Cancelled => {
            warn!("dropping batch of {entries} entries: send cancelled");
            shared.stats.record_failed(entries);
        }
    }

    shared.in_flight_entries.fetch_sub(entries, Ordering::AcqRel);
    let remaining = shared.in_flight_batches.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 && shared.queue.is_empty() {
        shared.idle.notify_waiters();
    }
}

/// Runs the retry loop for one batch: at most `1 + max_retries` attempts,
/// sleeping an exponentially growing backoff before each retry. Both the
/// sleep and the request are cut short by cancellation.
async fn dispatch_with_retries(
    shared: &Shared,
    batch: &[QueueEntry],
    cancel: &CancellationToken,
) -> BatchOutcome {
    // Hold a send slot for the whole attempt sequence so retries of one
    // batch don't let extra batches onto the wire.
    let _slot = match shared.send_slots.acquire().await {
        Ok(permit) => permit,
        // The semaphore lives as long as the batcher and is never closed.
        Err(_) => return BatchOutcome::Cancelled,
    };

    let mut backoff = shared.config.retry_backoff;
    let max_retries = shared.config.max_retries;
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return BatchOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(shared.config.max_retry_backoff);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return BatchOutcome::Cancelled,
            result = shared.sender.send_batch(batch) => result,
        };

        match result {
            Ok(()) => return BatchOutcome::Sent,
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    "batch send attempt {attempt}/{} failed, retrying in {:?}: {e}",
                    max_retries + 1,
                    backoff
                );
            }
            Err(e) => return BatchOutcome::Failed(e),
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
