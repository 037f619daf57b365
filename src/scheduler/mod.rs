// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job scheduling: daily cron and staggered startup triggers, single-flight.

pub mod coordinator;
pub mod cron;
pub mod error;
pub mod job;

pub use coordinator::JobCoordinator;
pub use cron::{DailySchedule, MISFIRE_GRACE};
pub use error::{JobError, SchedulerError};
pub use job::{Job, JobDefinition, JobRunRecord, JobState, RunOutcome, TriggerKind};
