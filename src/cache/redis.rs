// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis key/value store for the cache-aside layer.
//!
//! Values are plain Redis strings holding a serialized
//! [`CacheEntry`](super::CacheEntry). Keys can be namespaced with a prefix so
//! several workers share one Redis without colliding, and so `clear` only
//! touches this worker's keys.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use super::store::{CacheError, KeyValueStore};
use crate::resilience::retry::{retry, RetryConfig};

/// Keys fetched per SCAN round trip during `clear`.
const SCAN_COUNT: usize = 500;

pub struct RedisKeyValueStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "drep:" → "drep:list.active")
    prefix: String,
}

impl RedisKeyValueStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, CacheError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use replica_sync::cache::RedisKeyValueStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "gov:drep.list", "gov:epoch.current"
    /// let store = RedisKeyValueStore::with_prefix("redis://localhost", Some("gov:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, CacheError> {
        let client = Client::open(connection_string)
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        // Startup config: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| CacheError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    /// Apply the prefix to a key.
    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(value)
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl_hint: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // Round the native TTL up so Redis never expires a key before the
        // entry's own expiry does
        match ttl_hint.map(|ttl| ttl.as_secs() + 1) {
            Some(seconds) => conn
                .set_ex::<_, _, ()>(&key, value, seconds)
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
            None => conn
                .set::<_, _, ()>(&key, value)
                .await
                .map_err(|e| CacheError::Backend(e.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;

            if !keys.is_empty() {
                let deleted: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %self.prefix, removed, "Cleared cache keys");
        Ok(removed)
    }
}
