//! Job scheduler
//!
//! Dequeues jobs in order and runs each as its own task. At most one run per service is
//! active in-process; a job for a busy service stays queued until that run ends. The
//! persisted status CAS in the engine guards against other processes.
//!
//! A dequeued job is never lost: a run that finds its service busy elsewhere requeues the
//! job, and so does a run task that ends without a result (panic or abort).

use recflow_common::{time, Error, Result, ServiceStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::services;
use crate::engine::{RunControl, RunOutcome};
use crate::models::Job;
use crate::AppState;

type JobResult = (Job, Result<RunOutcome>);
type ActiveRuns = Arc<Mutex<HashMap<i64, RunControl>>>;

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<i64, RunControl>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct JobScheduler {
    state: AppState,
    /// Run controls of active runs, by service id
    active: ActiveRuns,
}

impl JobScheduler {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_services(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.active).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Start a run for every queued job whose service is idle
    ///
    /// Returns the number of runs started.
    pub async fn dispatch_ready(&self, tasks: &mut JoinSet<JobResult>) -> Result<usize> {
        self.dispatch(tasks, &HashSet::new()).await
    }

    async fn dispatch(&self, tasks: &mut JoinSet<JobResult>, held: &HashSet<i64>) -> Result<usize> {
        let queue = self.state.queue();
        let mut claimed = HashSet::new();
        for job in queue.list().await? {
            let busy = lock(&self.active).contains_key(&job.service_id);
            if busy || claimed.contains(&job.service_id) || held.contains(&job.service_id) {
                continue;
            }
            if !queue.remove(job.id).await? {
                continue;
            }
            claimed.insert(job.service_id);

            let control = RunControl::new();
            lock(&self.active).insert(job.service_id, control.clone());
            debug!(job_id = job.id, service_id = job.service_id, order = job.order, "Dispatching job");
            self.spawn_run(tasks, job, control);
        }
        Ok(claimed.len())
    }

    fn spawn_run(&self, tasks: &mut JoinSet<JobResult>, job: Job, control: RunControl) {
        let state = self.state.clone();
        let guard = RunGuard {
            state: self.state.clone(),
            active: self.active.clone(),
            service_id: job.service_id,
            unfinished: Some(job.clone()),
        };
        tasks.spawn(async move {
            let result = run_job(&state, &job, &control).await;
            guard.finish();

            if let Err(Error::AlreadyRunning(_)) = &result {
                warn!(service_id = job.service_id, "Service busy elsewhere; job requeued");
                requeue(&state, &job).await;
            }
            (job, result)
        });
    }

    /// Dispatch and await runs until nothing dispatchable is left
    ///
    /// Every started run is awaited even when another one fails. A service found busy
    /// elsewhere keeps its requeued job and is not dispatched again by this call. The
    /// first run failure is returned once all runs have ended.
    pub async fn run_until_idle(&self) -> Result<Vec<RunOutcome>> {
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut held = HashSet::new();
        let mut failure: Option<Error> = None;
        let mut dispatching = true;

        loop {
            if dispatching {
                match self.dispatch(&mut tasks, &held).await {
                    Ok(0) if tasks.is_empty() => break,
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "Job dispatch failed; waiting for active runs");
                        failure.get_or_insert(err);
                        dispatching = false;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(outcome))) => outcomes.push(outcome),
                Ok((job, Err(err))) => {
                    error!(job_id = job.id, service_id = job.service_id, error = %err, "Job failed");
                    if matches!(err, Error::AlreadyRunning(_)) {
                        held.insert(job.service_id);
                    }
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    error!(error = %err, "Run task panicked; waiting for active runs");
                    failure.get_or_insert(Error::Internal(format!("Run task failed: {}", err)));
                    dispatching = false;
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Dispatch until `shutdown` fires, then cancel active runs and requeue their jobs
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let poll = time::millis_to_duration(self.state.config.scheduler.poll_ms);
        let mut tasks = JoinSet::new();
        info!(poll_ms = self.state.config.scheduler.poll_ms, "Job scheduler started");

        loop {
            if let Err(err) = self.dispatch_ready(&mut tasks).await {
                error!(error = %err, "Job dispatch failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_finished(joined),
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!("Job scheduler stopping; canceling active runs");
        for control in lock(&self.active).values() {
            control.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job, Ok(outcome))) if outcome.status == ServiceStatus::Canceled => {
                    requeue(&self.state, &job).await;
                }
                other => log_finished(other),
            }
        }
        info!("Job scheduler stopped");
        Ok(())
    }

    pub fn pause(&self, service_id: i64) -> bool {
        self.with_control(service_id, RunControl::pause)
    }

    pub fn resume(&self, service_id: i64) -> bool {
        self.with_control(service_id, RunControl::resume)
    }

    pub fn cancel(&self, service_id: i64) -> bool {
        self.with_control(service_id, RunControl::cancel)
    }

    fn with_control(&self, service_id: i64, action: fn(&RunControl)) -> bool {
        match lock(&self.active).get(&service_id) {
            Some(control) => {
                action(control);
                true
            }
            None => false,
        }
    }
}

/// Active-run bookkeeping for one spawned run
///
/// Dropping the guard frees the service slot. A guard dropped without `finish` (the task
/// panicked or was aborted) puts its job back on the queue.
struct RunGuard {
    state: AppState,
    active: ActiveRuns,
    service_id: i64,
    unfinished: Option<Job>,
}

impl RunGuard {
    fn finish(mut self) {
        self.unfinished = None;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.service_id);
        let Some(job) = self.unfinished.take() else {
            return;
        };
        warn!(job_id = job.id, service_id = job.service_id, "Run ended without a result; requeuing job");
        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { requeue(&state, &job).await });
            }
            Err(_) => error!(service_id = job.service_id, "No runtime left to requeue job"),
        }
    }
}

async fn requeue(state: &AppState, job: &Job) {
    if let Err(err) = state
        .queue()
        .enqueue(job.service_id, job.output_set.as_deref(), job.kind)
        .await
    {
        error!(service_id = job.service_id, error = %err, "Failed to requeue job");
    }
}

async fn run_job(state: &AppState, job: &Job, control: &RunControl) -> Result<RunOutcome> {
    let info = services::load_service(&state.db, job.service_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("service {}", job.service_id)))?;
    let mut service = state.instantiate(&info)?;
    state
        .engine()
        .run(&mut *service, info.id, job.output_set.clone(), control)
        .await
}

fn log_finished(joined: std::result::Result<JobResult, tokio::task::JoinError>) {
    match joined {
        Ok((job, Ok(outcome))) => {
            info!(job_id = job.id, service_id = job.service_id, status = %outcome.status, "Job finished")
        }
        Ok((job, Err(err))) => {
            error!(job_id = job.id, service_id = job.service_id, error = %err, "Job failed")
        }
        Err(err) => error!(error = %err, "Run task panicked"),
    }
}
