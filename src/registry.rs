//! Job registry: one running stream worker per lot.
//!
//! All mutations go through a single mutex, so configure/stop/status calls are
//! linearizable. Configuring a lot that already runs cancels the old worker
//! without waiting for it and installs the new job under the same key with the
//! next generation number. A worker that exits on its own removes its entry only
//! while the entry still carries its generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lot::LotConfig;
use crate::worker::{
    CancelSignal, StreamWorker, WorkerContext, WorkerExit, WorkerJob, WorkerShared, WorkerState,
};
use crate::{LotId, Region};

/// Returned by `configure`.
#[derive(Clone, Debug, Serialize)]
pub struct JobInfo {
    pub lot_id: LotId,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// Returned by `stop` for a job that was running.
#[derive(Clone, Debug, Serialize)]
pub struct StoppedJob {
    pub lot_id: LotId,
    pub video_url: String,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

/// One row of `status`.
#[derive(Clone, Debug, Serialize)]
pub struct JobSummary {
    pub lot_id: LotId,
    pub lot_name: String,
    pub location: String,
    pub video_url: String,
    pub spots_count: usize,
    pub started_at: DateTime<Utc>,
    pub generation: u64,
    pub state: WorkerState,
    pub thread_alive: bool,
    pub frames_processed: u64,
    pub reports_submitted: u64,
}

/// A worker that stopped itself: connect attempts ran out, or its loop panicked.
#[derive(Clone, Debug, Serialize)]
pub struct JobFailure {
    pub lot_id: LotId,
    pub lot_name: String,
    pub video_url: String,
    pub generation: u64,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct LotJob {
    config: LotConfig,
    regions: Vec<Region>,
    generation: u64,
    started_at: DateTime<Utc>,
    cancel: CancelSignal,
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<LotId, LotJob>,
    next_generation: u64,
    failures: HashMap<LotId, JobFailure>,
    /// Cancelled workers not yet joined.
    retired: Vec<JoinHandle<()>>,
}

struct RegistryInner {
    context: WorkerContext,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Concurrency-safe map from lot id to running worker.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                context,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.inner.context
    }

    /// Start monitoring `config`, replacing any job already running for the lot.
    pub fn configure(&self, config: LotConfig) -> Result<JobInfo> {
        let mut state = self.inner.lock();
        state.retired.retain(|handle| !handle.is_finished());

        let lot_id = config.lot_id;
        let generation = state.next_generation + 1;
        let started_at = Utc::now();
        let regions = config.regions(self.inner.context.pipeline.params());
        let cancel = CancelSignal::new();

        let worker = StreamWorker::new(
            WorkerJob {
                lot_id,
                generation,
                started_at,
                locator: config.video_feed_url.clone(),
                regions: regions.clone(),
            },
            self.inner.context.clone(),
            cancel.clone(),
        );
        let shared = worker.shared();
        let registry = Arc::downgrade(&self.inner);
        // the new worker cannot release its entry before we install it: that needs this lock
        let handle = thread::Builder::new()
            .name(format!("lot-{}-gen-{}", lot_id, generation))
            .spawn(move || {
                let exit = worker.run();
                release(&registry, lot_id, generation, exit);
            })
            .with_context(|| format!("spawn worker for lot {}", lot_id))?;

        state.next_generation = generation;
        state.failures.remove(&lot_id);
        let job = LotJob {
            config,
            regions,
            generation,
            started_at,
            cancel,
            shared,
            handle,
        };
        if let Some(previous) = state.jobs.insert(lot_id, job) {
            previous.cancel.cancel();
            log::info!(
                "lot={}: replacing generation {} with {}",
                lot_id,
                previous.generation,
                generation
            );
            state.retired.push(previous.handle);
        } else {
            log::info!("lot={} gen={}: monitoring started", lot_id, generation);
        }

        Ok(JobInfo {
            lot_id,
            generation,
            started_at,
        })
    }

    /// Cancel and remove the job for `lot_id`. `None` when no job is configured.
    pub fn stop(&self, lot_id: LotId) -> Option<StoppedJob> {
        let mut state = self.inner.lock();
        let job = state.jobs.remove(&lot_id)?;
        job.cancel.cancel();
        state.retired.push(job.handle);
        log::info!("lot={} gen={}: monitoring stopped", lot_id, job.generation);
        Some(StoppedJob {
            lot_id,
            video_url: job.config.video_feed_url,
            generation: job.generation,
            started_at: job.started_at,
            stopped_at: Utc::now(),
        })
    }

    /// Snapshot of every configured job, ordered by lot id.
    pub fn status(&self) -> Vec<JobSummary> {
        let state = self.inner.lock();
        let mut jobs: Vec<JobSummary> = state
            .jobs
            .iter()
            .map(|(lot_id, job)| JobSummary {
                lot_id: *lot_id,
                lot_name: job.config.name.clone(),
                location: job.config.location.clone(),
                video_url: job.config.video_feed_url.clone(),
                spots_count: job.regions.len(),
                started_at: job.started_at,
                generation: job.generation,
                state: job.shared.state(),
                thread_alive: !job.handle.is_finished(),
                frames_processed: job.shared.frames_processed(),
                reports_submitted: job.shared.reports_submitted(),
            })
            .collect();
        jobs.sort_by_key(|job| job.lot_id);
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn regions_for(&self, lot_id: LotId) -> Option<Vec<Region>> {
        self.inner
            .lock()
            .jobs
            .get(&lot_id)
            .map(|job| job.regions.clone())
    }

    /// Workers that gave up, ordered by lot id. Cleared per lot on reconfigure.
    pub fn failures(&self) -> Vec<JobFailure> {
        let mut failures: Vec<JobFailure> = self.inner.lock().failures.values().cloned().collect();
        failures.sort_by_key(|failure| failure.lot_id);
        failures
    }

    /// Cancel every worker and wait for all of them to exit.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.inner.lock();
            let mut handles: Vec<_> = state.retired.drain(..).collect();
            for (_, job) in state.jobs.drain() {
                job.cancel.cancel();
                handles.push(job.handle);
            }
            handles
        };
        log::info!("registry shutting down; joining {} workers", handles.len());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("stream worker panicked");
            }
        }
    }
}

/// Runs on the worker thread after `run` returns.
fn release(registry: &Weak<RegistryInner>, lot_id: LotId, generation: u64, exit: WorkerExit) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut state = inner.lock();
    let owns_entry = state
        .jobs
        .get(&lot_id)
        .is_some_and(|job| job.generation == generation);
    if !owns_entry {
        return;
    }
    let Some(job) = state.jobs.remove(&lot_id) else {
        return;
    };
    let failure = match exit {
        WorkerExit::Cancelled => None,
        WorkerExit::RetriesExhausted {
            attempts,
            locator,
            last_error,
        } => Some((attempts, locator, last_error)),
        WorkerExit::Panicked { message } => Some((
            0,
            job.config.video_feed_url.clone(),
            format!("worker panicked: {}", message),
        )),
    };
    if let Some((attempts, video_url, error)) = failure {
        state.failures.insert(
            lot_id,
            JobFailure {
                lot_id,
                lot_name: job.config.name.clone(),
                video_url,
                generation,
                attempts,
                error,
                failed_at: Utc::now(),
            },
        );
    }
    log::info!("lot={} gen={}: worker released its registry entry", lot_id, generation);
    // our own handle: dropping it detaches this thread
    drop(job.handle);
}
