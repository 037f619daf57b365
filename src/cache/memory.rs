// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::store::{CacheError, KeyValueStore};

/// Process-local key/value store.
///
/// Keeps the TTL hint it was given but never expires anything itself, which
/// makes it a faithful stand-in for a store whose native TTL cannot be
/// trusted.
pub struct InMemoryKeyValueStore {
    data: DashMap<String, (String, Option<Duration>)>,
}

impl InMemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current key count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// TTL hint passed with the last write of `key`
    #[must_use]
    pub fn ttl_hint(&self, key: &str) -> Option<Duration> {
        self.data.get(key).and_then(|r| r.value().1)
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.data.get(key).map(|r| r.value().0.clone()))
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl_hint: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.data.insert(key.to_string(), (value.to_string(), ttl_hint));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let removed = self.data.len() as u64;
        self.data.clear();
        Ok(removed)
    }
}
