//! Per-lot stream worker.
//!
//! A `StreamWorker` owns one lot's monitoring loop:
//!
//! ```text
//! Connecting --open ok--> Streaming --read error--> Reconnecting --pause, rewind--> Streaming
//!     |                        |
//!     +--budget exhausted--+   +--cancelled--+
//!                          v                 v
//!                       Stopped           Stopped
//! ```
//!
//! Each frame is classified, stabilized, and kept as the latest verdict. Once per
//! update interval the latest non-empty verdict is handed to the reporter. The
//! cancellation signal is checked before every frame read and before every
//! report, and wakes every sleep early. The source handle is dropped on every
//! exit path, and a panic inside the loop ends the worker instead of its thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::{annotate, encode_jpeg, FramePipeline, Stabilizer, DEFAULT_WINDOW};
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceOpener};
use crate::reporter::{Reporter, SubmitOutcome};
use crate::{LotId, Region, ReportBatch, SpotDetection};

// -------------------- Cancellation --------------------

/// Cooperative cancellation flag with wake-up for sleeping waiters.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep up to `timeout`. Returns `true` if cancelled (before or during the wait).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

// -------------------- Settings and shared state --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub update_interval: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub read_retry_delay: Duration,
    pub frame_pause: Duration,
    pub window_size: usize,
    pub fps_log_interval: Duration,
    /// Save an annotated frame at every report boundary when set.
    pub debug_image_dir: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(15),
            connect_attempts: 5,
            connect_retry_delay: Duration::from_secs(5),
            read_retry_delay: Duration::from_secs(1),
            frame_pause: Duration::from_millis(10),
            window_size: DEFAULT_WINDOW,
            fps_log_interval: Duration::from_secs(5),
            debug_image_dir: None,
        }
    }
}

/// Worker progress readable from other threads.
pub struct WorkerShared {
    state: Mutex<WorkerState>,
    frames_processed: AtomicU64,
    reports_submitted: AtomicU64,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Connecting),
            frames_processed: AtomicU64::new(0),
            reports_submitted: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn reports_submitted(&self) -> u64 {
        self.reports_submitted.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: WorkerState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// How a worker ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    RetriesExhausted {
        attempts: u32,
        locator: String,
        last_error: String,
    },
    /// The loop panicked; the worker stopped instead of unwinding its thread.
    Panicked {
        message: String,
    },
}

/// Frames dropped after each processed frame; grows by one every 1000 frames.
pub fn skip_stride(processed: u64) -> u64 {
    (processed / 1000).max(1)
}

// -------------------- Worker --------------------

/// The lot a worker monitors, fixed for the worker's lifetime.
#[derive(Clone, Debug)]
pub struct WorkerJob {
    pub lot_id: LotId,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub locator: String,
    pub regions: Vec<Region>,
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub opener: Arc<dyn SourceOpener>,
    pub reporter: Arc<Reporter>,
    pub pipeline: FramePipeline,
    pub settings: WorkerSettings,
}

pub struct StreamWorker {
    job: WorkerJob,
    context: WorkerContext,
    cancel: CancelSignal,
    stabilizer: Stabilizer,
    shared: Arc<WorkerShared>,
}

impl StreamWorker {
    pub fn new(job: WorkerJob, context: WorkerContext, cancel: CancelSignal) -> Self {
        let stabilizer = Stabilizer::for_generation(context.settings.window_size, job.generation);
        Self {
            job,
            context,
            cancel,
            stabilizer,
            shared: Arc::new(WorkerShared::new()),
        }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    /// Run until cancelled or the connect budget is spent.
    pub fn run(mut self) -> WorkerExit {
        log::info!(
            "lot={} gen={}: worker starting on {} ({} spots)",
            self.job.lot_id,
            self.job.generation,
            self.job.locator,
            self.job.regions.len()
        );
        let exit = match panic::catch_unwind(AssertUnwindSafe(|| self.connect_and_stream())) {
            Ok(exit) => exit,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!(
                    "lot={} gen={}: worker panicked: {}",
                    self.job.lot_id,
                    self.job.generation,
                    message
                );
                WorkerExit::Panicked { message }
            }
        };
        self.shared.set_state(WorkerState::Stopped);
        log::info!(
            "lot={} gen={}: worker stopped ({:?})",
            self.job.lot_id,
            self.job.generation,
            exit
        );
        exit
    }

    fn connect_and_stream(&mut self) -> WorkerExit {
        match self.connect() {
            Ok(source) => self.stream(source),
            Err(exit) => exit,
        }
    }

    fn connect(&self) -> std::result::Result<Box<dyn FrameSource>, WorkerExit> {
        let settings = &self.context.settings;
        let attempts = settings.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(WorkerExit::Cancelled);
            }
            self.shared.set_state(WorkerState::Connecting);
            match self.context.opener.open(&self.job.locator) {
                Ok(source) => return Ok(source),
                Err(err) => {
                    last_error = format!("{:#}", err);
                    log::warn!(
                        "lot={} gen={}: connect attempt {}/{} failed: {}",
                        self.job.lot_id,
                        self.job.generation,
                        attempt,
                        attempts,
                        last_error
                    );
                }
            }
            if attempt < attempts && self.cancel.wait_timeout(settings.connect_retry_delay) {
                return Err(WorkerExit::Cancelled);
            }
        }
        log::error!(
            "lot={} gen={}: failed to open {} after {} attempts",
            self.job.lot_id,
            self.job.generation,
            self.job.locator,
            attempts
        );
        Err(WorkerExit::RetriesExhausted {
            attempts,
            locator: self.job.locator.clone(),
            last_error,
        })
    }

    fn stream(&mut self, mut source: Box<dyn FrameSource>) -> WorkerExit {
        let settings = self.context.settings.clone();
        let mut latest: Vec<SpotDetection> = Vec::new();
        let mut latest_frame: Option<Frame> = None;
        let mut processed: u64 = 0;
        let mut last_report = Instant::now();
        let mut fps_started = Instant::now();
        let mut fps_frames: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return WorkerExit::Cancelled;
            }
            self.shared.set_state(WorkerState::Streaming);

            match source.next_frame() {
                Ok(frame) => {
                    match self.process(&frame) {
                        Ok(detections) => latest = detections,
                        Err(err) => log::warn!(
                            "lot={} gen={}: discarding frame {}: {:#}",
                            self.job.lot_id,
                            self.job.generation,
                            frame.sequence,
                            err
                        ),
                    }
                    if settings.debug_image_dir.is_some() {
                        latest_frame = Some(frame);
                    }
                    processed += 1;
                    fps_frames += 1;
                    self.shared.frames_processed.fetch_add(1, Ordering::Relaxed);

                    for _ in 0..skip_stride(processed) {
                        if self.cancel.is_cancelled() {
                            return WorkerExit::Cancelled;
                        }
                        if source.next_frame().is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    self.shared.set_state(WorkerState::Reconnecting);
                    log::warn!(
                        "lot={} gen={}: failed to read frame from {} ({:#}); restarting stream",
                        self.job.lot_id,
                        self.job.generation,
                        self.job.locator,
                        err
                    );
                    if self.cancel.wait_timeout(settings.read_retry_delay) {
                        return WorkerExit::Cancelled;
                    }
                    if let Err(err) = source.rewind() {
                        log::debug!(
                            "lot={} gen={}: rewind failed: {:#}",
                            self.job.lot_id,
                            self.job.generation,
                            err
                        );
                    }
                    continue;
                }
            }

            let elapsed = fps_started.elapsed();
            if elapsed >= settings.fps_log_interval {
                log::info!(
                    "lot={} gen={}: processing at {:.2} FPS",
                    self.job.lot_id,
                    self.job.generation,
                    fps_frames as f64 / elapsed.as_secs_f64()
                );
                fps_frames = 0;
                fps_started = Instant::now();
            }

            if self.cancel.is_cancelled() {
                return WorkerExit::Cancelled;
            }
            if last_report.elapsed() >= settings.update_interval {
                self.report(&latest);
                if let (Some(dir), Some(frame)) = (&settings.debug_image_dir, &latest_frame) {
                    if let Err(err) = self.save_debug_image(dir, frame, &latest) {
                        log::warn!(
                            "lot={} gen={}: failed to save debug image: {:#}",
                            self.job.lot_id,
                            self.job.generation,
                            err
                        );
                    }
                }
                last_report = Instant::now();
            }

            if self.cancel.wait_timeout(settings.frame_pause) {
                return WorkerExit::Cancelled;
            }
        }
    }

    fn process(&mut self, frame: &Frame) -> Result<Vec<SpotDetection>> {
        let raw = self.context.pipeline.classify(frame, &self.job.regions)?;
        Ok(self.stabilizer.detections(&raw))
    }

    fn report(&self, detections: &[SpotDetection]) {
        if detections.is_empty() {
            log::debug!(
                "lot={} gen={}: no detections to send",
                self.job.lot_id,
                self.job.generation
            );
            return;
        }
        let batch = ReportBatch::new(
            self.job.lot_id,
            self.job.generation,
            self.job.started_at,
            detections.to_vec(),
        );
        if self.context.reporter.submit(batch) == SubmitOutcome::Accepted {
            self.shared.reports_submitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn save_debug_image(&self, dir: &Path, frame: &Frame, detections: &[SpotDetection]) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create debug image dir {}", dir.display()))?;
        let annotated = annotate(frame.image(), &self.job.regions, detections);
        let path = dir.join(format!(
            "lot_{}_{}.jpg",
            self.job.lot_id,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::write(&path, encode_jpeg(&annotated)?)
            .with_context(|| format!("write debug image {}", path.display()))?;
        log::debug!("lot={}: saved debug image {}", self.job.lot_id, path.display());
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
