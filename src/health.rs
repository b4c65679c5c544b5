//! Service health snapshot for `GET /health`.
//!
//! Backend reachability comes from `SinkMonitor`, which probes the sink on its
//! own thread, so building a report never waits on the network.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::JobRegistry;
use crate::reporter::{Reporter, Utilization};
use crate::transport::{ReportSink, SinkReachability, SinkStatus};
use crate::worker::CancelSignal;

pub const SERVICE_NAME: &str = "parking-monitor";

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub service: &'static str,
    pub version: &'static str,
    pub active_jobs: usize,
    pub failed_jobs: usize,
    pub workers: Utilization,
    pub backend_connection: SinkReachability,
    pub system: SystemInfo,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemInfo {
    pub crate_version: &'static str,
    /// Lot workers plus report dispatchers.
    pub worker_threads: usize,
    pub update_interval_seconds: u64,
}

impl HealthReport {
    pub fn collect(
        registry: &JobRegistry,
        reporter: &Reporter,
        backend_connection: SinkReachability,
    ) -> Self {
        let status = registry.status();
        let live_workers = status.iter().filter(|job| job.thread_alive).count();
        let workers = reporter.utilization();
        Self {
            status: "healthy",
            timestamp: Utc::now(),
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            active_jobs: status.len(),
            failed_jobs: registry.failures().len(),
            workers,
            backend_connection,
            system: SystemInfo {
                crate_version: env!("CARGO_PKG_VERSION"),
                worker_threads: live_workers + workers.max_workers,
                update_interval_seconds: registry.context().settings.update_interval.as_secs(),
            },
        }
    }
}

/// Latest sink probe result, refreshed every `interval` on a background thread.
pub struct SinkMonitor {
    latest: Arc<Mutex<SinkReachability>>,
    cancel: CancelSignal,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SinkMonitor {
    /// Starts with `Unknown` until the first probe, which runs immediately.
    pub fn start(sink: Arc<dyn ReportSink>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(anyhow!("probe interval must be greater than zero"));
        }
        let latest = Arc::new(Mutex::new(SinkReachability::new(
            SinkStatus::Unknown,
            sink.endpoint(),
        )));
        let cancel = CancelSignal::new();

        let thread_latest = Arc::clone(&latest);
        let thread_cancel = cancel.clone();
        let join = std::thread::Builder::new()
            .name("sink-probe".to_string())
            .spawn(move || loop {
                let reachability = sink.probe();
                if reachability.status != SinkStatus::Connected {
                    log::debug!(
                        "backend {} is {:?}",
                        reachability.api_url,
                        reachability.status
                    );
                }
                *thread_latest
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = reachability;
                if thread_cancel.wait_timeout(interval) {
                    break;
                }
            })
            .context("spawn sink probe thread")?;

        Ok(Self {
            latest,
            cancel,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn latest(&self) -> SinkReachability {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Stop probing. Waits for a probe already in flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let join = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("sink probe thread panicked");
            }
        }
    }
}

impl Drop for SinkMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
