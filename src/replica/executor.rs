// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover query executor.
//!
//! ```text
//!  execute(query, mapper)
//!        │
//!        ▼
//!  endpoints with closed breakers, priority order
//!  (all open → highest priority only)
//!        │
//!        ▼  for each endpoint
//!  ┌──────────────────────────────────────────────┐
//!  │ retry_if(transient), backoff base·2^(n-1)    │
//!  │   acquire DB-op permit (blocks when full)    │
//!  │   connect  ── connect timeout               │
//!  │   fetch    ── read timeout                  │
//!  │   map rows                                  │
//!  └──────────────────────────────────────────────┘
//!        │ ok → reset breaker, return rows
//!        │ err → record breaker failure, next endpoint
//!        ▼
//!  AllEndpointsFailed { last error }
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backend::{DbTimeouts, ReplicaBackend};
use super::endpoint::{Endpoint, EndpointRegistry};
use super::error::{FailoverError, QueryError, TimeoutPhase};
use crate::config::ReplicaSyncConfig;
use crate::resilience::circuit_breaker::BreakerStateStore;
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::sql_value::SqlQuery;

static DB_OPS_SEMAPHORE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// The process-wide database operation limiter.
///
/// The first call fixes the permit count; later calls return the same
/// instance regardless of `permits`.
pub fn shared_db_semaphore(permits: usize) -> Arc<Semaphore> {
    DB_OPS_SEMAPHORE
        .get_or_init(|| {
            info!(permits, "Initialized process-wide database operation limiter");
            Arc::new(Semaphore::new(permits.max(1)))
        })
        .clone()
}

/// Reads from an ordered list of replicas with per-endpoint circuit
/// breaking, bounded retry and a shared concurrency limit.
pub struct FailoverExecutor<B: ReplicaBackend> {
    registry: Arc<EndpointRegistry>,
    backend: Arc<B>,
    breakers: Arc<BreakerStateStore>,
    limiter: Arc<Semaphore>,
    retry: RetryConfig,
    timeouts: DbTimeouts,
}

impl<B: ReplicaBackend> Clone for FailoverExecutor<B> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            backend: self.backend.clone(),
            breakers: self.breakers.clone(),
            limiter: self.limiter.clone(),
            retry: self.retry.clone(),
            timeouts: self.timeouts,
        }
    }
}

impl<B: ReplicaBackend> FailoverExecutor<B> {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        backend: Arc<B>,
        breakers: Arc<BreakerStateStore>,
        limiter: Arc<Semaphore>,
        retry: RetryConfig,
        timeouts: DbTimeouts,
    ) -> Self {
        Self {
            registry,
            backend,
            breakers,
            limiter,
            retry,
            timeouts,
        }
    }

    /// Build an executor from config, sharing the process-wide limiter.
    pub fn from_config(
        registry: Arc<EndpointRegistry>,
        backend: Arc<B>,
        config: &ReplicaSyncConfig,
    ) -> Self {
        Self::new(
            registry,
            backend,
            Arc::new(BreakerStateStore::new(config.circuit())),
            shared_db_semaphore(config.max_concurrent_db_ops),
            config.retry(),
            config.timeouts(),
        )
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerStateStore> {
        &self.breakers
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Endpoints to try for the next execution, in order.
    ///
    /// Falls back to the highest-priority endpoint when every breaker is open.
    #[must_use]
    pub fn select_endpoints(&self) -> Selection<'_> {
        let closed: Vec<&Endpoint> = self
            .registry
            .iter()
            .filter(|e| !self.breakers.is_open(&e.key))
            .collect();

        if !closed.is_empty() {
            return Selection { endpoints: closed, forced: false };
        }

        match self.registry.primary() {
            Some(primary) => {
                warn!(
                    endpoint = %primary.key,
                    "All endpoint circuits open, forcing highest-priority endpoint"
                );
                Selection { endpoints: vec![primary], forced: true }
            }
            None => Selection { endpoints: Vec::new(), forced: false },
        }
    }

    /// Run `query` against the first healthy endpoint and map every row.
    #[tracing::instrument(skip(self, query, mapper), fields(endpoint))]
    pub async fn execute<T, M>(&self, query: &SqlQuery, mapper: M) -> Result<Vec<T>, FailoverError>
    where
        M: Fn(&B::Row) -> Result<T, QueryError>,
    {
        let selection = self.select_endpoints();
        if selection.endpoints.is_empty() {
            return Err(FailoverError::NoEndpoints);
        }

        // A forced endpoint is already known to be failing: one attempt only
        let retry = if selection.forced {
            RetryConfig::once()
        } else {
            self.retry.clone()
        };
        let mut last_failure: Option<(String, QueryError)> = None;
        let attempted = selection.endpoints.len();

        for endpoint in selection.endpoints {
            let op_name = format!("replica_query:{}", endpoint.key);
            let result = retry_if(&op_name, &retry, AttemptError::is_retriable, || {
                self.attempt(endpoint, query, &mapper)
            })
            .await;

            match result {
                Ok(rows) => {
                    self.breakers.record_success(&endpoint.key);
                    crate::metrics::record_endpoint_attempt(&endpoint.key, "success");
                    tracing::Span::current().record("endpoint", endpoint.key.as_str());
                    debug!(endpoint = %endpoint.key, rows = rows.len(), "Replica query succeeded");
                    return Ok(rows);
                }
                Err(AttemptError::LimiterClosed) => return Err(FailoverError::LimiterClosed),
                Err(AttemptError::Query(err)) => {
                    self.breakers.record_failure(&endpoint.key);
                    crate::metrics::record_endpoint_attempt(&endpoint.key, err.kind());
                    warn!(
                        endpoint = %endpoint.key,
                        retriable = err.is_retriable(),
                        error = %err,
                        "Replica endpoint failed, trying next"
                    );
                    last_failure = Some((endpoint.key.clone(), err));
                }
            }
        }

        crate::metrics::record_failover_exhausted();
        match last_failure {
            Some((last_endpoint, source)) => Err(FailoverError::AllEndpointsFailed {
                attempted,
                last_endpoint,
                source,
            }),
            None => Err(FailoverError::NoEndpoints),
        }
    }

    /// One attempt: permit, connect, fetch, map.
    async fn attempt<T, M>(
        &self,
        endpoint: &Endpoint,
        query: &SqlQuery,
        mapper: &M,
    ) -> Result<Vec<T>, AttemptError>
    where
        M: Fn(&B::Row) -> Result<T, QueryError>,
    {
        let wait_start = Instant::now();
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| AttemptError::LimiterClosed)?;
        crate::metrics::record_semaphore_wait(wait_start.elapsed());

        let started = Instant::now();
        let mut conn = timeout(self.timeouts.connect, self.backend.connect(endpoint))
            .await
            .map_err(|_| QueryError::Timeout {
                phase: TimeoutPhase::Connect,
                timeout: self.timeouts.connect,
            })??;

        let rows = timeout(self.timeouts.read, self.backend.fetch(&mut conn, query))
            .await
            .map_err(|_| QueryError::Timeout {
                phase: TimeoutPhase::Read,
                timeout: self.timeouts.read,
            })??;
        crate::metrics::record_query_latency(&endpoint.key, started.elapsed());

        let mapped = rows.iter().map(mapper).collect::<Result<Vec<T>, QueryError>>()?;
        Ok(mapped)
    }
}

/// Endpoints chosen for one execution.
#[derive(Debug)]
pub struct Selection<'a> {
    pub endpoints: Vec<&'a Endpoint>,
    /// Every breaker was open and the highest-priority endpoint was forced
    pub forced: bool,
}

/// Failure of a single attempt.
#[derive(Debug)]
enum AttemptError {
    Query(QueryError),
    LimiterClosed,
}

impl From<QueryError> for AttemptError {
    fn from(err: QueryError) -> Self {
        AttemptError::Query(err)
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(e) => write!(f, "{}", e),
            Self::LimiterClosed => write!(f, "database operation limiter closed"),
        }
    }
}

impl AttemptError {
    fn is_retriable(&self) -> bool {
        match self {
            Self::Query(e) => e.is_retriable(),
            Self::LimiterClosed => false,
        }
    }
}
