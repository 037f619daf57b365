// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Distributed key/value store holding serialized cache entries.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value. `ttl_hint` lets the store expire the key natively; the
    /// cache layer does not rely on it.
    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl_hint: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key this store owns, best effort. Returns keys removed.
    async fn clear(&self) -> Result<u64, CacheError>;
}
