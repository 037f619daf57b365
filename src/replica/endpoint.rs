// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup database endpoints and their priority order.

use std::fmt;

use serde::Deserialize;

/// One read replica.
///
/// Lower `priority` values are tried first.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub key: String,
    pub priority: i32,
    pub connection_string: String,
}

impl Endpoint {
    pub fn new(key: impl Into<String>, priority: i32, connection_string: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            priority,
            connection_string: connection_string.into(),
        }
    }
}

// Connection strings carry credentials
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

/// Immutable, priority-ordered set of endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    /// Build a registry. Ties keep their configured order.
    #[must_use]
    pub fn new(mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        Self { endpoints }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// Highest-priority endpoint.
    #[must_use]
    pub fn primary(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.key == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
