// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background cache writer.
//!
//! Fire-and-forget writes are queued on a bounded channel and applied by a
//! single owned task. Nothing is spawned per write, so the process keeps one
//! place that observes, counts and logs write failures. A full queue drops
//! the write instead of blocking the caller: the cache is an optimisation and
//! the next miss will repopulate it.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use replica_sync::cache::{CacheWriter, InMemoryKeyValueStore};
//! # async fn example() {
//! let writer = CacheWriter::spawn(Arc::new(InMemoryKeyValueStore::new()), 1024);
//! writer.dispatch_set("drep.list", "{}".to_string(), None);
//! writer.flush().await;
//! assert_eq!(writer.stats().written, 1);
//! # }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::{CacheError, KeyValueStore};
use crate::metrics;

enum WriteOp {
    Set {
        key: String,
        value: String,
        ttl_hint: Option<Duration>,
    },
    Remove {
        key: String,
        /// Set when the caller waits for the store's answer
        done: Option<oneshot::Sender<Result<(), CacheError>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Point-in-time view of background write outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheWriterStats {
    /// Writes accepted onto the queue
    pub dispatched: u64,
    pub written: u64,
    /// Writes the store rejected (or panicked on)
    pub failed: u64,
    /// Writes refused because the queue was full or shut down
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    tx: mpsc::Sender<WriteOp>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the background write task. Cheap to clone.
#[derive(Clone)]
pub struct CacheWriter {
    inner: Arc<Inner>,
}

impl CacheWriter {
    /// Start the write task. Must be called inside a Tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, queue_len: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_writer(
            Arc::clone(&store),
            rx,
            Arc::clone(&counters),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                store,
                tx,
                counters,
                cancel,
                handle: parking_lot::Mutex::new(Some(handle)),
            }),
        }
    }

    /// Queue a write. Returns false if the write was dropped.
    pub fn dispatch_set(&self, key: &str, value: String, ttl_hint: Option<Duration>) -> bool {
        self.dispatch(WriteOp::Set {
            key: key.to_string(),
            value,
            ttl_hint,
        })
    }

    /// Queue a removal. Returns false if it was dropped.
    pub fn dispatch_remove(&self, key: &str) -> bool {
        self.dispatch(WriteOp::Remove {
            key: key.to_string(),
            done: None,
        })
    }

    /// Remove `key` after every write already queued and wait for the store.
    ///
    /// Never dropped: waits for queue capacity instead. Once the task has
    /// stopped the removal goes straight to the store.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        if !self.inner.cancel.is_cancelled() {
            let (done_tx, done_rx) = oneshot::channel();
            let op = WriteOp::Remove {
                key: key.to_string(),
                done: Some(done_tx),
            };
            if self.inner.tx.send(op).await.is_ok() {
                if let Ok(result) = done_rx.await {
                    return result;
                }
            }
        }
        self.inner.store.remove(key).await
    }

    fn dispatch(&self, op: WriteOp) -> bool {
        if self.inner.cancel.is_cancelled() {
            self.record_dropped("shut down");
            return false;
        }
        match self.inner.tx.try_send(op) {
            Ok(()) => {
                self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_dropped("queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_dropped("closed");
                false
            }
        }
    }

    fn record_dropped(&self, reason: &'static str) {
        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_background_write("dropped");
        warn!(reason, "Background cache write dropped");
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.tx.send(WriteOp::Flush(done_tx)).await.is_err() {
            return;
        }
        // A dropped sender means the task exited; nothing left to wait for
        let _ = done_rx.await;
    }

    #[must_use]
    pub fn stats(&self) -> CacheWriterStats {
        let c = &self.inner.counters;
        CacheWriterStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting writes, apply what is already queued, then stop the task.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache writer task ended abnormally");
            }
        }
    }
}

async fn run_writer(
    store: Arc<dyn KeyValueStore>,
    mut rx: mpsc::Receiver<WriteOp>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    debug!("Cache writer started");
    loop {
        let op = tokio::select! {
            biased;
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        apply(store.as_ref(), op, &counters).await;
    }

    rx.close();
    while let Ok(op) = rx.try_recv() {
        apply(store.as_ref(), op, &counters).await;
    }
    debug!("Cache writer stopped");
}

async fn apply(store: &dyn KeyValueStore, op: WriteOp, counters: &Counters) {
    let (key, result) = match op {
        WriteOp::Flush(done) => {
            let _ = done.send(());
            return;
        }
        WriteOp::Set {
            key,
            value,
            ttl_hint,
        } => {
            let result = AssertUnwindSafe(store.set_string(&key, &value, ttl_hint))
                .catch_unwind()
                .await;
            (key, result)
        }
        WriteOp::Remove {
            key,
            done: Some(done),
        } => {
            let result = AssertUnwindSafe(store.remove(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CacheError::Backend("store panicked on remove".into())));
            // The caller may have given up waiting
            let _ = done.send(result);
            return;
        }
        WriteOp::Remove { key, done: None } => {
            let result = AssertUnwindSafe(store.remove(&key)).catch_unwind().await;
            (key, result)
        }
    };

    match result {
        Ok(Ok(())) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_background_write("written");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_background_write("failed");
            warn!(key = %key, error = %e, "Background cache write failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_background_write("failed");
            warn!(key = %key, "Background cache write panicked");
        }
    }
}
