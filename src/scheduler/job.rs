// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::JobError;

/// Static description of a scheduled job.
///
/// ```
/// use std::time::Duration;
/// use replica_sync::scheduler::JobDefinition;
///
/// let list = JobDefinition::new("drep-list", "0 0 2 * * ?").with_startup(Duration::from_secs(5));
/// let meta = JobDefinition::new("drep-metadata", "0 30 2 * * ?")
///     .with_startup(Duration::from_secs(30))
///     .depends_on("drep-list");
/// assert_eq!(meta.depends_on.as_deref(), Some("drep-list"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    /// Daily trigger, evaluated in UTC
    pub cron_expr: String,
    pub daily_enabled: bool,
    pub startup_enabled: bool,
    pub startup_delay: Duration,
    /// Producer whose startup offset this job's startup run is placed after
    pub depends_on: Option<String>,
}

impl JobDefinition {
    /// Daily trigger on, startup trigger off.
    pub fn new(name: &str, cron_expr: &str) -> Self {
        Self {
            name: name.to_string(),
            cron_expr: cron_expr.to_string(),
            daily_enabled: true,
            startup_enabled: false,
            startup_delay: Duration::ZERO,
            depends_on: None,
        }
    }

    #[must_use]
    pub fn with_startup(mut self, delay: Duration) -> Self {
        self.startup_enabled = true;
        self.startup_delay = delay;
        self
    }

    #[must_use]
    pub fn daily(mut self, enabled: bool) -> Self {
        self.daily_enabled = enabled;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, producer: &str) -> Self {
        self.depends_on = Some(producer.to_string());
        self
    }
}

/// A job body. Implementations need not guard against overlapping runs;
/// the coordinator never runs one job twice at once.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<(), JobError>;
}

/// Whether a job is running. A failed run returns the job to `Idle` and is
/// kept as the [`RunOutcome`] of its [`JobRunRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Daily,
    Startup,
    Manual,
}

impl TriggerKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Startup => "startup",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Record of one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRunRecord {
    pub run_id: Uuid,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}
