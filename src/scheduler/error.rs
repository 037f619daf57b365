// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use crate::replica::FailoverError;
use crate::upsert::UpsertError;

/// Failure of a job body. Marks the run Failed; the next trigger runs again.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("replica read failed: {0}")]
    Failover(#[from] FailoverError),

    #[error("upsert failed: {0}")]
    Upsert(#[from] UpsertError),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    #[error("Job '{job}' depends on '{dependency}', which is not registered before it")]
    UnknownDependency { job: String, dependency: String },

    #[error("Scheduler '{0}' is already started")]
    AlreadyStarted(String),
}
