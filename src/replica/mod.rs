// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read replicas: endpoint registry, query backends and the failover executor.

pub mod backend;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod postgres;

pub use backend::{DbTimeouts, ReplicaBackend};
pub use endpoint::{Endpoint, EndpointRegistry};
pub use error::{FailoverError, QueryError, TimeoutPhase};
pub use executor::{shared_db_semaphore, FailoverExecutor, Selection};
pub use postgres::PgReplicaBackend;
