// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside layer with value-embedded expiry.

pub mod aside;
pub mod entry;
pub mod memory;
pub mod outcome;
pub mod redis;
pub mod store;
pub mod writer;

pub use aside::{CacheAside, CacheBatchResult};
pub use entry::CacheEntry;
pub use memory::InMemoryKeyValueStore;
pub use outcome::{track, CacheLookup, CacheOutcome};
pub use redis::RedisKeyValueStore;
pub use store::{CacheError, KeyValueStore};
pub use writer::{CacheWriter, CacheWriterStats};
