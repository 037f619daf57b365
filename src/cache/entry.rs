// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cached value with its own expiry.
///
/// This wrapper is the only payload stored under a cache key, and its
/// `expiry_epoch_millis` is authoritative: whatever TTL the underlying store
/// applies is only a backstop. `0` means the entry never expires.
///
/// ```
/// use replica_sync::cache::CacheEntry;
/// use std::time::Duration;
///
/// let entry = CacheEntry::new("drep-list", Some(Duration::from_secs(60)), 1_000);
/// assert_eq!(entry.expiry_epoch_millis, 61_000);
/// assert!(!entry.is_expired(61_000));
/// assert!(entry.is_expired(61_001));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub expiry_epoch_millis: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Option<Duration>, now_millis: i64) -> Self {
        let expiry_epoch_millis = match ttl {
            Some(ttl) if !ttl.is_zero() => now_millis.saturating_add(ttl.as_millis() as i64),
            _ => 0,
        };
        Self {
            data,
            expiry_epoch_millis,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiry_epoch_millis > 0 && now_millis > self.expiry_epoch_millis
    }
}
