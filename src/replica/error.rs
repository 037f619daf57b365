// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for replica queries.
//!
//! Retriable-transient: connection and socket failures, timeouts, pool
//! exhaustion and transient SQLSTATE codes (including "too many clients").
//! Everything else (bad SQL, constraint violations, auth failures, mapping
//! errors) is non-retriable.

use std::time::Duration;

use thiserror::Error;

/// Which of the two per-operation timeouts fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// SQLSTATE codes worth retrying.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "53000", // insufficient_resources
    "53200", // out_of_memory
    "53300", // too_many_connections
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
    "57014", // query_canceled (statement_timeout)
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{phase} timeout after {timeout:?}")]
    Timeout { phase: TimeoutPhase, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("database error [{}]: {message}", code.as_deref().unwrap_or("?"))]
    Database { code: Option<String>, message: String },

    #[error("row mapping failed: {0}")]
    Mapping(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl QueryError {
    pub fn database(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping(message.into())
    }

    /// Whether another attempt against the same endpoint may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout { .. } | Self::Io(_) | Self::PoolExhausted(_) => true,
            Self::Database { code, message } => {
                let transient_code = code.as_deref().is_some_and(|c| {
                    // Class 08: connection exception
                    c.starts_with("08") || TRANSIENT_SQLSTATES.contains(&c)
                });
                transient_code || message.to_ascii_lowercase().contains("too many clients")
            }
            Self::Mapping(_) | Self::Protocol(_) | Self::Configuration(_) => false,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Database { .. } => "database",
            Self::Mapping(_) => "mapping",
            Self::Protocol(_) => "protocol",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => Self::Io(e.to_string()),
            sqlx::Error::Tls(e) => Self::Connect(e.to_string()),
            sqlx::Error::PoolTimedOut => Self::PoolExhausted("timed out acquiring a connection".to_string()),
            sqlx::Error::PoolClosed => Self::Connect("pool closed".to_string()),
            sqlx::Error::WorkerCrashed => Self::Io("connection worker crashed".to_string()),
            sqlx::Error::Database(db) => Self::Database {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::Configuration(e) => Self::Configuration(e.to_string()),
            sqlx::Error::Protocol(msg) => Self::Protocol(msg),
            e @ (sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)) => Self::Mapping(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Failure of a whole failover execution.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("no replica endpoints configured")]
    NoEndpoints,

    #[error("database operation limiter closed")]
    LimiterClosed,

    #[error("all {attempted} replica endpoint(s) failed; last error from '{last_endpoint}': {source}")]
    AllEndpointsFailed {
        attempted: usize,
        last_endpoint: String,
        #[source]
        source: QueryError,
    },
}

impl FailoverError {
    /// The last underlying query error, if any endpoint was attempted.
    #[must_use]
    pub fn last_error(&self) -> Option<&QueryError> {
        match self {
            Self::AllEndpointsFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
