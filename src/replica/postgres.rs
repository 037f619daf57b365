// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Postgres replica backend.
//!
//! Each endpoint gets its own lazily-connected pool, created on first use
//! and reused for the life of the process. Pools never connect eagerly, so a
//! dead replica costs nothing until it is selected.
//!
//! The read timeout is enforced twice: client-side by the executor, which
//! drops the in-flight future, and server-side through `statement_timeout`
//! so the replica stops working on a query nobody is waiting for.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres};
use tracing::debug;

use super::backend::{DbTimeouts, ReplicaBackend};
use super::endpoint::Endpoint;
use super::error::QueryError;
use crate::sql_value::SqlQuery;

pub struct PgReplicaBackend {
    pools: DashMap<String, PgPool>,
    timeouts: DbTimeouts,
    max_connections: u32,
}

impl PgReplicaBackend {
    #[must_use]
    pub fn new(timeouts: DbTimeouts, max_connections: u32) -> Self {
        Self {
            pools: DashMap::new(),
            timeouts,
            max_connections: max_connections.max(1),
        }
    }

    fn pool_for(&self, endpoint: &Endpoint) -> Result<PgPool, QueryError> {
        if let Some(pool) = self.pools.get(&endpoint.key) {
            return Ok(pool.clone());
        }

        let statement_timeout_ms = self.timeouts.read.as_millis();
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.timeouts.connect)
            .idle_timeout(Duration::from_secs(300))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(format!("SET statement_timeout = {}", statement_timeout_ms).as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect_lazy(&endpoint.connection_string)
            .map_err(QueryError::from)?;

        debug!(endpoint = %endpoint.key, "Created replica pool");
        // Another task may have raced us; keep whichever landed first
        let pool = self
            .pools
            .entry(endpoint.key.clone())
            .or_insert(pool)
            .clone();
        Ok(pool)
    }

}

#[async_trait]
impl ReplicaBackend for PgReplicaBackend {
    type Connection = PoolConnection<Postgres>;
    type Row = PgRow;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, QueryError> {
        let pool = self.pool_for(endpoint)?;
        pool.acquire().await.map_err(|e| match QueryError::from(e) {
            QueryError::Io(msg) => QueryError::Connect(msg),
            other => other,
        })
    }

    async fn fetch(
        &self,
        conn: &mut Self::Connection,
        query: &SqlQuery,
    ) -> Result<Vec<Self::Row>, QueryError> {
        query
            .to_sqlx()
            .fetch_all(&mut **conn)
            .await
            .map_err(QueryError::from)
    }

    async fn close(&self) {
        let pools: Vec<PgPool> = self.pools.iter().map(|p| p.value().clone()).collect();
        let count = pools.len();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
        debug!(pools = count, "Closed replica pools");
    }
}
