// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named, in-process job coordinator.
//!
//! Each job gets a daily cron trigger (UTC) and optionally a one-shot
//! startup trigger fired after a delay. The coordinator guarantees at most
//! one in-flight run per job: a fire that arrives while the job is running is
//! dropped (logged and counted), never queued.
//!
//! # Startup ordering
//!
//! A job may name a producer with `depends_on`. Under
//! [`StartupOrdering::Delay`] its startup delay is added to the producer's
//! effective delay and nothing checks that the producer actually finished.
//! Under [`StartupOrdering::AwaitCompletion`] the dependent waits until the
//! producer's startup run has finished (either way), then applies its own
//! delay.
//!
//! # Misfires
//!
//! A daily fire that could not be taken on time (the process was suspended,
//! the runtime was starved) fires once as soon as the coordinator notices,
//! and the schedule resumes from the current time.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cron::DailySchedule;
use super::error::SchedulerError;
use super::job::{Job, JobDefinition, JobRunRecord, JobState, RunOutcome, TriggerKind};
use crate::clock::{system_clock, SharedClock};
use crate::config::StartupOrdering;
use crate::metrics;

struct RegisteredJob {
    definition: JobDefinition,
    schedule: Option<DailySchedule>,
    body: Arc<dyn Job>,
    /// Single-flight guard
    running: AtomicBool,
    state: Mutex<JobState>,
    last_run: Mutex<Option<JobRunRecord>>,
    /// Set once the startup trigger has fired
    startup_fired: AtomicBool,
    /// true once the startup run has finished (or there is none)
    startup_settled: watch::Sender<bool>,
}

struct Inner {
    name: String,
    clock: SharedClock,
    ordering: StartupOrdering,
    jobs: RwLock<HashMap<String, Arc<RegisteredJob>>>,
    /// Registration order
    order: RwLock<Vec<String>>,
    started: AtomicBool,
    cancel: CancellationToken,
    triggers: Mutex<Vec<JoinHandle<()>>>,
    runs: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a named scheduler instance. Cheap to clone.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(name: &str, ordering: StartupOrdering) -> Self {
        Self::with_clock(name, ordering, system_clock())
    }

    pub fn with_clock(name: &str, ordering: StartupOrdering, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                clock,
                ordering,
                jobs: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                triggers: Mutex::new(Vec::new()),
                runs: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a job. The job graph is fixed once [`start`](Self::start) runs,
    /// and a producer must be registered before its dependents.
    pub fn register_job(
        &self,
        definition: JobDefinition,
        body: Arc<dyn Job>,
    ) -> Result<(), SchedulerError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted(self.inner.name.clone()));
        }

        let mut jobs = self.inner.jobs.write();
        if jobs.contains_key(&definition.name) {
            return Err(SchedulerError::DuplicateJob(definition.name));
        }
        if let Some(dependency) = &definition.depends_on {
            if !jobs.contains_key(dependency) {
                return Err(SchedulerError::UnknownDependency {
                    job: definition.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let schedule = if definition.daily_enabled {
            Some(DailySchedule::parse(&definition.cron_expr)?)
        } else {
            None
        };

        let (startup_settled, _) = watch::channel(!definition.startup_enabled);
        let name = definition.name.clone();
        jobs.insert(
            name.clone(),
            Arc::new(RegisteredJob {
                definition,
                schedule,
                body,
                running: AtomicBool::new(false),
                state: Mutex::new(JobState::Idle),
                last_run: Mutex::new(None),
                startup_fired: AtomicBool::new(false),
                startup_settled,
            }),
        );
        self.inner.order.write().push(name.clone());

        debug!(scheduler = %self.inner.name, job = %name, "Job registered");
        Ok(())
    }

    /// Arm every trigger. Must be called inside a Tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted(self.inner.name.clone()));
        }

        let order = self.inner.order.read().clone();
        let mut triggers = self.inner.triggers.lock();

        for name in &order {
            let Some(job) = self.job(name) else { continue };

            if job.schedule.is_some() {
                triggers.push(tokio::spawn(Self::daily_loop(
                    Arc::clone(&self.inner),
                    Arc::clone(&job),
                )));
            }

            if job.definition.startup_enabled {
                let (wait_for, delay) = self.startup_plan(&job);
                info!(
                    scheduler = %self.inner.name,
                    job = %name,
                    delay_ms = delay.as_millis() as u64,
                    after = wait_for.as_ref().map(|p| p.definition.name.as_str()),
                    "Startup run scheduled"
                );
                triggers.push(tokio::spawn(Self::startup_once(
                    Arc::clone(&self.inner),
                    job,
                    wait_for,
                    delay,
                )));
            }
        }

        info!(scheduler = %self.inner.name, jobs = order.len(), "Scheduler started");
        Ok(())
    }

    /// Fire `name` now. Returns `Ok(false)` if the job was already running.
    pub fn trigger(&self, name: &str) -> Result<bool, SchedulerError> {
        let job = self
            .job(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Ok(Self::fire(&self.inner, &job, TriggerKind::Manual))
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<JobState> {
        self.job(name).map(|job| *job.state.lock())
    }

    #[must_use]
    pub fn last_run(&self, name: &str) -> Option<JobRunRecord> {
        self.job(name).and_then(|job| job.last_run.lock().clone())
    }

    /// Registered job names, in registration order.
    #[must_use]
    pub fn job_names(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    /// Stop all triggers and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let triggers: Vec<_> = std::mem::take(&mut *self.inner.triggers.lock());
        for handle in triggers {
            let _ = handle.await;
        }

        // Triggers are stopped, so no new runs can be added now
        let runs: Vec<_> = std::mem::take(&mut *self.inner.runs.lock());
        let in_flight = runs.iter().filter(|h| !h.is_finished()).count();
        if in_flight > 0 {
            info!(scheduler = %self.inner.name, in_flight, "Waiting for running jobs");
        }
        for handle in runs {
            if let Err(e) = handle.await {
                error!(scheduler = %self.inner.name, error = %e, "Job task ended abnormally");
            }
        }
        info!(scheduler = %self.inner.name, "Scheduler stopped");
    }

    fn job(&self, name: &str) -> Option<Arc<RegisteredJob>> {
        self.inner.jobs.read().get(name).cloned()
    }

    /// Producer to wait for (completion ordering only) and the delay to sleep.
    fn startup_plan(&self, job: &RegisteredJob) -> (Option<Arc<RegisteredJob>>, Duration) {
        match self.inner.ordering {
            StartupOrdering::Delay => (None, self.effective_delay(job)),
            StartupOrdering::AwaitCompletion => {
                let producer = job.definition.depends_on.as_deref().and_then(|p| self.job(p));
                (producer, job.definition.startup_delay)
            }
        }
    }

    /// Own delay plus the effective delay of the producer chain.
    fn effective_delay(&self, job: &RegisteredJob) -> Duration {
        let mut delay = job.definition.startup_delay;
        let mut next = job.definition.depends_on.clone();
        // Producers are registered before dependents, so the chain is acyclic
        while let Some(producer) = next.and_then(|name| self.job(&name)) {
            if producer.definition.startup_enabled {
                delay += producer.definition.startup_delay;
            }
            next = producer.definition.depends_on.clone();
        }
        delay
    }

    async fn startup_once(
        inner: Arc<Inner>,
        job: Arc<RegisteredJob>,
        wait_for: Option<Arc<RegisteredJob>>,
        delay: Duration,
    ) {
        if let Some(producer) = wait_for {
            let mut settled = producer.startup_settled.subscribe();
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                result = settled.wait_for(|done| *done) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
            debug!(job = %job.definition.name, producer = %producer.definition.name, "Producer startup run finished");
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        job.startup_fired.store(true, Ordering::SeqCst);
        if !Self::fire(&inner, &job, TriggerKind::Startup) && !job.running.load(Ordering::SeqCst) {
            // The run that blocked this fire finished in between
            job.startup_settled.send_replace(true);
        }
    }

    async fn daily_loop(inner: Arc<Inner>, job: Arc<RegisteredJob>) {
        let Some(schedule) = job.schedule.clone() else { return };
        let name = job.definition.name.clone();

        let Some(mut next) = schedule.next_after(inner.clock.now_utc()) else {
            warn!(job = %name, cron = %schedule.expr(), "Cron expression never fires");
            return;
        };
        debug!(job = %name, next = %next, "Daily trigger armed");

        loop {
            let now = inner.clock.now_utc();
            let wait = (next - now).to_std().unwrap_or_default();
            if !wait.is_zero() {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }
            if inner.cancel.is_cancelled() {
                break;
            }

            if DailySchedule::is_misfire(next, now) {
                warn!(job = %name, scheduled = %next, now = %now, "Daily trigger misfired, firing now");
            }
            Self::fire(&inner, &job, TriggerKind::Daily);

            // Missed slots collapse into the fire above
            match schedule.next_after(now) {
                Some(upcoming) => next = upcoming,
                None => break,
            }
        }
        debug!(job = %name, "Daily trigger stopped");
    }

    /// Start a run unless one is in flight. Returns whether it started.
    fn fire(inner: &Arc<Inner>, job: &Arc<RegisteredJob>, trigger: TriggerKind) -> bool {
        let name = &job.definition.name;
        if inner.cancel.is_cancelled() {
            debug!(job = %name, %trigger, "Fire ignored, scheduler stopping");
            return false;
        }
        if job
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            metrics::record_job_skipped(name);
            info!(job = %name, %trigger, "Job already running, fire dropped");
            return false;
        }

        *job.state.lock() = JobState::Running;
        let handle = tokio::spawn(Self::execute(Arc::clone(inner), Arc::clone(job), trigger));

        let mut runs = inner.runs.lock();
        runs.retain(|h| !h.is_finished());
        runs.push(handle);
        true
    }

    async fn execute(inner: Arc<Inner>, job: Arc<RegisteredJob>, trigger: TriggerKind) {
        let name = job.definition.name.clone();
        let run_id = Uuid::new_v4();
        let started_at = inner.clock.now_utc();
        let start = Instant::now();
        info!(scheduler = %inner.name, job = %name, %trigger, %run_id, "Job run started");

        let outcome = match AssertUnwindSafe(job.body.run()).catch_unwind().await {
            Ok(Ok(())) => RunOutcome::Succeeded,
            Ok(Err(e)) => RunOutcome::Failed(e.to_string()),
            Err(_) => RunOutcome::Failed("job panicked".to_string()),
        };
        let elapsed = start.elapsed();

        match &outcome {
            RunOutcome::Succeeded => {
                metrics::record_job_run(&name, "success", elapsed);
                info!(job = %name, %run_id, elapsed_ms = elapsed.as_millis() as u64, "Job run succeeded");
            }
            RunOutcome::Failed(reason) => {
                metrics::record_job_run(&name, "failure", elapsed);
                error!(job = %name, %run_id, error = %reason, "Job run failed");
            }
        }

        *job.last_run.lock() = Some(JobRunRecord {
            run_id,
            trigger,
            started_at,
            finished_at: inner.clock.now_utc(),
            outcome,
        });
        *job.state.lock() = JobState::Idle;
        job.running.store(false, Ordering::SeqCst);

        if job.startup_fired.load(Ordering::SeqCst) {
            job.startup_settled.send_replace(true);
        }
    }
}
