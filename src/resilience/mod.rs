// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience primitives: per-endpoint circuit breaking and retry with backoff.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerState, BreakerStateStore, CircuitConfig, CircuitState};
pub use retry::{retry, retry_if, RetryConfig};
