//! Non-blocking result reporter.
//!
//! Workers hand stabilized batches to `Reporter::submit`, which never blocks:
//! the batch goes onto a bounded queue drained by a fixed pool of dispatcher
//! threads. A full queue drops the batch with a warning. Delivery failures are
//! logged and discarded; there are no retries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::transport::ReportSink;
use crate::ReportBatch;

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Dispatcher pool sizing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterSettings {
    /// Dispatcher threads (W).
    pub max_workers: usize,
    /// Batches that may wait for a free dispatcher.
    pub queue_depth: usize,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_depth: DEFAULT_MAX_WORKERS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Queue saturated or reporter shut down.
    Dropped,
}

/// Dispatcher pool counters, as shown by the health endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Utilization {
    pub max_workers: usize,
    pub active_workers: usize,
    pub available_workers: usize,
    pub queued: usize,
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    accepted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

pub struct Reporter {
    settings: ReporterSettings,
    sender: Mutex<Option<Sender<ReportBatch>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Reporter {
    pub fn start(sink: Arc<dyn ReportSink>, settings: ReporterSettings) -> Result<Self> {
        if settings.max_workers == 0 {
            return Err(anyhow!("reporter needs at least one dispatcher"));
        }
        let (sender, receiver) = crossbeam_channel::bounded(settings.queue_depth);
        let counters = Arc::new(Counters::default());

        let mut dispatchers = Vec::with_capacity(settings.max_workers);
        for index in 0..settings.max_workers {
            let receiver = receiver.clone();
            let sink = Arc::clone(&sink);
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("report-dispatch-{}", index))
                .spawn(move || dispatch_loop(receiver, sink, counters))
                .context("spawn report dispatcher")?;
            dispatchers.push(handle);
        }
        log::info!(
            "reporter started: {} dispatchers, queue depth {}, sink {}",
            settings.max_workers,
            settings.queue_depth,
            sink.endpoint()
        );

        Ok(Self {
            settings,
            sender: Mutex::new(Some(sender)),
            dispatchers: Mutex::new(dispatchers),
            counters,
        })
    }

    /// Queue `batch` for delivery without waiting.
    pub fn submit(&self, batch: ReportBatch) -> SubmitOutcome {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("reporter closed; dropping batch for lot {}", batch.lot_id);
            return SubmitOutcome::Dropped;
        };
        match sender.try_send(batch) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Accepted
            }
            Err(TrySendError::Full(batch)) | Err(TrySendError::Disconnected(batch)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "report queue saturated; dropping batch for lot {} ({} detections)",
                    batch.lot_id,
                    batch.detections.len()
                );
                SubmitOutcome::Dropped
            }
        }
    }

    pub fn utilization(&self) -> Utilization {
        let queued = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(0, |sender| sender.len());
        let active = self.counters.active.load(Ordering::Relaxed);
        Utilization {
            max_workers: self.settings.max_workers,
            active_workers: active,
            available_workers: self.settings.max_workers.saturating_sub(active),
            queued,
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, let dispatchers drain it, and join them.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handles: Vec<_> = self
            .dispatchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("report dispatcher panicked");
            }
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(receiver: Receiver<ReportBatch>, sink: Arc<dyn ReportSink>, counters: Arc<Counters>) {
    while let Ok(batch) = receiver.recv() {
        counters.active.fetch_add(1, Ordering::Relaxed);
        match sink.deliver(&batch) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "lot={} gen={}: sent {} detections",
                    batch.lot_id,
                    batch.generation,
                    batch.detections.len()
                );
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "lot={} gen={}: report delivery failed: {:#}",
                    batch.lot_id,
                    batch.generation,
                    err
                );
            }
        }
        counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemorySink, SinkReachability, SinkStatus};
    use crate::SpotDetection;
    use chrono::Utc;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::time::Duration;

    fn batch(lot_id: i64) -> ReportBatch {
        ReportBatch::new(
            lot_id,
            1,
            Utc::now(),
            vec![SpotDetection {
                spot_id: 1,
                is_occupied: false,
                confidence: 0.6,
                license_plate: None,
            }],
        )
    }

    /// Sink that announces each delivery and then blocks until released.
    struct GateSink {
        entered: Sender<i64>,
        release: Receiver<()>,
        delivered: Mutex<Vec<i64>>,
    }

    impl ReportSink for GateSink {
        fn endpoint(&self) -> String {
            "gate://".to_string()
        }

        fn deliver(&self, batch: &ReportBatch) -> Result<()> {
            self.entered.send(batch.lot_id)?;
            self.release.recv()?;
            self.delivered.lock().unwrap().push(batch.lot_id);
            Ok(())
        }

        fn probe(&self) -> SinkReachability {
            SinkReachability::new(SinkStatus::Unknown, self.endpoint())
        }
    }

    #[test]
    fn delivers_accepted_batches() {
        let sink = Arc::new(MemorySink::new());
        let reporter = Reporter::start(sink.clone(), ReporterSettings::default()).unwrap();
        for lot in 0..3 {
            assert_eq!(reporter.submit(batch(lot)), SubmitOutcome::Accepted);
        }
        reporter.shutdown();
        assert_eq!(sink.len(), 3);
        let util = reporter.utilization();
        assert_eq!(util.accepted, 3);
        assert_eq!(util.delivered, 3);
        assert_eq!(util.active_workers, 0);
    }

    #[test]
    fn saturated_queue_drops_without_blocking() {
        let (entered_tx, entered_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        let sink = Arc::new(GateSink {
            entered: entered_tx,
            release: release_rx,
            delivered: Mutex::new(Vec::new()),
        });
        let reporter = Reporter::start(
            sink.clone(),
            ReporterSettings {
                max_workers: 1,
                queue_depth: 1,
            },
        )
        .unwrap();

        assert_eq!(reporter.submit(batch(1)), SubmitOutcome::Accepted);
        // dispatcher is now parked inside deliver(1)
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(reporter.submit(batch(2)), SubmitOutcome::Accepted);
        assert_eq!(reporter.submit(batch(3)), SubmitOutcome::Dropped);

        let util = reporter.utilization();
        assert_eq!(util.active_workers, 1);
        assert_eq!(util.available_workers, 0);
        assert_eq!(util.queued, 1);
        assert_eq!(util.dropped, 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        reporter.shutdown();
        assert_eq!(*sink.delivered.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn failed_delivery_is_counted_not_retried() {
        let sink = Arc::new(MemorySink::failing());
        let reporter = Reporter::start(sink, ReporterSettings::default()).unwrap();
        reporter.submit(batch(9));
        reporter.shutdown();
        let util = reporter.utilization();
        assert_eq!(util.failed, 1);
        assert_eq!(util.delivered, 0);
    }

    #[test]
    fn submit_after_shutdown_is_dropped() {
        let reporter =
            Reporter::start(Arc::new(MemorySink::new()), ReporterSettings::default()).unwrap();
        reporter.shutdown();
        assert_eq!(reporter.submit(batch(1)), SubmitOutcome::Dropped);
    }

    #[test]
    fn zero_dispatchers_rejected() {
        let settings = ReporterSettings {
            max_workers: 0,
            queue_depth: 1,
        };
        assert!(Reporter::start(Arc::new(MemorySink::new()), settings).is_err());
    }
}
