// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;

use super::endpoint::Endpoint;
use super::error::QueryError;
use crate::sql_value::SqlQuery;

/// The two independent timeouts applied to every database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbTimeouts {
    /// Acquiring a connection to an endpoint
    pub connect: Duration,
    /// Running one query on an acquired connection
    pub read: Duration,
}

impl Default for DbTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(30),
        }
    }
}

/// Relational query capability for a single endpoint.
///
/// Connecting and fetching are separate steps so the executor can put a
/// distinct timeout around each. Implementations do not retry; the executor
/// owns retry and failover.
#[async_trait]
pub trait ReplicaBackend: Send + Sync + 'static {
    type Connection: Send;
    type Row: Send;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, QueryError>;

    async fn fetch(
        &self,
        conn: &mut Self::Connection,
        query: &SqlQuery,
    ) -> Result<Vec<Self::Row>, QueryError>;

    /// Release pooled connections. Called once on worker shutdown.
    async fn close(&self) {}
}
