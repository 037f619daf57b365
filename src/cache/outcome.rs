// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-request cache outcome side channel.
//!
//! An HTTP layer wraps request handling in [`track`] and reads back the
//! HIT/MISS outcome of every cache lookup made while serving it, e.g. to set
//! an `X-Cache` header. Lookups made outside a tracked scope are simply not
//! recorded.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub key: String,
    pub outcome: CacheOutcome,
}

tokio::task_local! {
    static OUTCOMES: RefCell<Vec<CacheLookup>>;
}

/// Run `fut` with outcome tracking enabled and return its output together
/// with the lookups it made, in order.
pub async fn track<F: Future>(fut: F) -> (F::Output, Vec<CacheLookup>) {
    OUTCOMES
        .scope(RefCell::new(Vec::new()), async move {
            let output = fut.await;
            let lookups = OUTCOMES.with(|cell| cell.take());
            (output, lookups)
        })
        .await
}

/// Record a lookup in the current tracked scope, if any.
pub(crate) fn record(key: &str, outcome: CacheOutcome) {
    let _ = OUTCOMES.try_with(|cell| {
        cell.borrow_mut().push(CacheLookup {
            key: key.to_string(),
            outcome,
        });
    });
}
