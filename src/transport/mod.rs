//! Result sinks.
//!
//! A `ReportSink` receives stabilized `ReportBatch`es from the reporter's
//! dispatcher threads. Implementations:
//! - `HttpSink`: posts JSON to the backend's ML update endpoint
//! - `MemorySink`: records batches in memory, for tests and dry runs

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::{LotId, ReportBatch};

mod http;

pub use http::HttpSink;

/// Destination for stabilized detection batches.
///
/// `deliver` is called from dispatcher threads, concurrently, and must be
/// bounded in time.
pub trait ReportSink: Send + Sync {
    /// Human-readable destination, for logs and health output.
    fn endpoint(&self) -> String;

    fn deliver(&self, batch: &ReportBatch) -> Result<()>;

    /// Cheap reachability check used by the health endpoint.
    fn probe(&self) -> SinkReachability;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkStatus {
    Connected,
    Error,
    Unreachable,
    Unknown,
}

/// Result of a sink probe.
#[derive(Clone, Debug, Serialize)]
pub struct SinkReachability {
    pub status: SinkStatus,
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SinkReachability {
    pub fn new(status: SinkStatus, api_url: impl Into<String>) -> Self {
        Self {
            status,
            api_url: api_url.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// In-memory sink. Optionally fails every delivery.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<ReportBatch>>,
    failing: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every delivery fails, as an unreachable backend would.
    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn batches(&self) -> Vec<ReportBatch> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn batches_for(&self, lot_id: LotId) -> Vec<ReportBatch> {
        self.lock()
            .iter()
            .filter(|batch| batch.lot_id == lot_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ReportBatch>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ReportSink for MemorySink {
    fn endpoint(&self) -> String {
        "memory://".to_string()
    }

    fn deliver(&self, batch: &ReportBatch) -> Result<()> {
        if self.failing {
            return Err(anyhow!("memory sink configured to fail"));
        }
        self.lock().push(batch.clone());
        Ok(())
    }

    fn probe(&self) -> SinkReachability {
        let status = if self.failing {
            SinkStatus::Unreachable
        } else {
            SinkStatus::Connected
        };
        SinkReachability::new(status, self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpotDetection;
    use chrono::Utc;

    fn batch(lot_id: LotId) -> ReportBatch {
        ReportBatch::new(
            lot_id,
            1,
            Utc::now(),
            vec![SpotDetection {
                spot_id: 1,
                is_occupied: true,
                confidence: 0.8,
                license_plate: None,
            }],
        )
    }

    #[test]
    fn memory_sink_records_batches_per_lot() -> Result<()> {
        let sink = MemorySink::new();
        sink.deliver(&batch(1))?;
        sink.deliver(&batch(2))?;
        sink.deliver(&batch(1))?;
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.batches_for(1).len(), 2);
        assert_eq!(sink.probe().status, SinkStatus::Connected);
        Ok(())
    }

    #[test]
    fn failing_sink_rejects_deliveries() {
        let sink = MemorySink::failing();
        assert!(sink.deliver(&batch(1)).is_err());
        assert!(sink.is_empty());
        assert_eq!(sink.probe().status, SinkStatus::Unreachable);
    }

    #[test]
    fn reachability_serializes_lowercase_status() {
        let value = serde_json::to_value(
            SinkReachability::new(SinkStatus::Error, "http://backend/api").with_message("HTTP 503"),
        )
        .unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "HTTP 503");
    }
}
