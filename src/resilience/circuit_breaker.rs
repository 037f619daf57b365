// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-endpoint circuit breaking.
//!
//! Tracks consecutive failures per endpoint key and answers "is this endpoint
//! currently usable?". An endpoint is excluded while its failure streak has
//! reached the threshold and the last failure is younger than the cooldown.
//! Once the cooldown passes the endpoint is usable again without any reset
//! call; a further failure re-opens it immediately because the streak is
//! still at or above the threshold.
//!
//! States:
//! - Closed: endpoint is routed to normally
//! - Open: endpoint is skipped until the cooldown elapses
//!
//! State lives in memory for the life of the process. Each
//! [`BreakerStateStore`] is an independent instance, so tests inject their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration shared by every endpoint breaker in a store
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures that opens the circuit
    pub failure_threshold: u32,
    /// How long an open circuit excludes its endpoint
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Trips on the first failure and stays open longer
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 1,
            cooldown: Duration::from_secs(120),
        }
    }

    /// Tolerates more failures before excluding an endpoint
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(15),
        }
    }
}

/// Failure streak of a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    /// Epoch millis of the most recent failure
    pub last_failure_at: Option<i64>,
}

impl BreakerState {
    fn is_open(&self, config: &CircuitConfig, now_millis: i64) -> bool {
        match self.last_failure_at {
            Some(at) if self.consecutive_failures >= config.failure_threshold => {
                now_millis.saturating_sub(at) < config.cooldown.as_millis() as i64
            }
            _ => false,
        }
    }
}

/// In-memory breaker state keyed by endpoint key.
#[derive(Debug)]
pub struct BreakerStateStore {
    config: CircuitConfig,
    clock: SharedClock,
    states: Mutex<HashMap<String, BreakerState>>,
    trips: AtomicU64,
}

impl Default for BreakerStateStore {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl BreakerStateStore {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    #[must_use]
    pub fn with_clock(config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
            trips: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Whether the endpoint is currently excluded.
    #[must_use]
    pub fn is_open(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.states
            .lock()
            .get(key)
            .is_some_and(|s| s.is_open(&self.config, now))
    }

    #[must_use]
    pub fn state(&self, key: &str) -> CircuitState {
        if self.is_open(key) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Current streak for an endpoint (`{0, None}` if never failed).
    #[must_use]
    pub fn snapshot(&self, key: &str) -> BreakerState {
        self.states.lock().get(key).copied().unwrap_or_default()
    }

    /// Record one failed endpoint attempt and return the resulting state.
    pub fn record_failure(&self, key: &str) -> CircuitState {
        let now = self.clock.now_millis();
        let (was_open, state) = {
            let mut states = self.states.lock();
            let entry = states.entry(key.to_string()).or_default();
            let was_open = entry.is_open(&self.config, now);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_failure_at = Some(now);
            (was_open, *entry)
        };

        let open = state.is_open(&self.config, now);
        if open && !was_open {
            self.trips.fetch_add(1, Ordering::Relaxed);
            warn!(
                endpoint = %key,
                consecutive_failures = state.consecutive_failures,
                cooldown = ?self.config.cooldown,
                "Circuit opened, endpoint excluded"
            );
            crate::metrics::set_circuit_state(key, CircuitState::Open as u8);
        } else {
            debug!(endpoint = %key, consecutive_failures = state.consecutive_failures, "Endpoint failure recorded");
        }

        if open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Record a successful attempt, clearing any failure streak.
    pub fn record_success(&self, key: &str) {
        let previous = {
            let mut states = self.states.lock();
            match states.get_mut(key) {
                Some(state) if state.consecutive_failures > 0 => {
                    let previous = *state;
                    *state = BreakerState::default();
                    Some(previous)
                }
                _ => None,
            }
        };

        if let Some(previous) = previous {
            info!(
                endpoint = %key,
                cleared_failures = previous.consecutive_failures,
                "Endpoint recovered, failure streak reset"
            );
            crate::metrics::set_circuit_state(key, CircuitState::Closed as u8);
        }
    }

    /// Number of closed→open transitions since creation
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Forget every endpoint's streak.
    pub fn reset_all(&self) {
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store_with_clock(threshold: u32, cooldown_secs: u64) -> (BreakerStateStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = BreakerStateStore::with_clock(
            CircuitConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
            clock.clone(),
        );
        (store, clock)
    }

    #[test]
    fn test_unknown_endpoint_is_closed() {
        let (store, _) = store_with_clock(3, 60);
        assert!(!store.is_open("replica-a"));
        assert_eq!(store.snapshot("replica-a"), BreakerState::default());
    }

    #[test]
    fn test_opens_at_threshold() {
        let (store, _) = store_with_clock(3, 60);

        assert_eq!(store.record_failure("replica-a"), CircuitState::Closed);
        assert_eq!(store.record_failure("replica-a"), CircuitState::Closed);
        assert!(!store.is_open("replica-a"));

        assert_eq!(store.record_failure("replica-a"), CircuitState::Open);
        assert!(store.is_open("replica-a"));
        assert_eq!(store.trips(), 1);
    }

    #[test]
    fn test_self_heals_after_cooldown() {
        let (store, clock) = store_with_clock(3, 60);
        for _ in 0..3 {
            store.record_failure("replica-a");
        }
        assert!(store.is_open("replica-a"));

        clock.advance(Duration::from_secs(59));
        assert!(store.is_open("replica-a"));

        clock.advance(Duration::from_secs(1));
        assert!(!store.is_open("replica-a"));
        // Streak is kept until a success; state alone no longer excludes
        assert_eq!(store.snapshot("replica-a").consecutive_failures, 3);
    }

    #[test]
    fn test_failure_after_cooldown_reopens_immediately() {
        let (store, clock) = store_with_clock(3, 60);
        for _ in 0..3 {
            store.record_failure("replica-a");
        }
        clock.advance(Duration::from_secs(61));
        assert!(!store.is_open("replica-a"));

        assert_eq!(store.record_failure("replica-a"), CircuitState::Open);
        assert_eq!(store.trips(), 2);
    }

    #[test]
    fn test_success_resets_streak() {
        let (store, clock) = store_with_clock(3, 60);
        store.record_failure("replica-a");
        store.record_failure("replica-a");
        store.record_success("replica-a");

        assert_eq!(store.snapshot("replica-a"), BreakerState::default());

        // A new streak has to start from zero
        store.record_failure("replica-a");
        store.record_failure("replica-a");
        assert!(!store.is_open("replica-a"));
        clock.advance(Duration::from_secs(1));
        store.record_failure("replica-a");
        assert!(store.is_open("replica-a"));
    }

    #[test]
    fn test_endpoints_are_independent() {
        let (store, _) = store_with_clock(1, 60);
        store.record_failure("replica-a");

        assert!(store.is_open("replica-a"));
        assert!(!store.is_open("replica-b"));

        store.reset_all();
        assert!(!store.is_open("replica-a"));
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.cooldown > lenient.cooldown);
    }
}
