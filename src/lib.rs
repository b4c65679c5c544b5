//! Parking Occupancy Monitor
//!
//! This crate watches parking lots through live video and reports which spots
//! are occupied to a backend service.
//!
//! # Architecture
//!
//! Each configured lot runs one independent monitoring worker:
//!
//! 1. **Frame sources** (`ingest`) produce decoded frames from a video locator.
//! 2. **Frame pipeline** (`detect::FramePipeline`) turns a frame plus spot regions
//!    into raw per-spot occupancy classifications.
//! 3. **Stabilizer** (`detect::Stabilizer`) debounces flicker with a per-spot
//!    majority vote over a short sliding window.
//! 4. **Reporter** (`reporter`) hands stabilized batches to a bounded pool of
//!    dispatchers that post them to the backend without blocking the worker.
//! 5. **Job registry** (`registry`) owns the set of running workers and serializes
//!    configure/stop/status calls.
//!
//! # Module Structure
//!
//! - `frame`: decoded frame container
//! - `ingest`: frame sources (synthetic, local files, HTTP MJPEG, GStreamer)
//! - `detect`: frame pipeline, stabilizer, annotation
//! - `lot`: validated lot configuration records
//! - `transport`: result sinks (backend HTTP, in-memory)
//! - `reporter`, `worker`, `registry`, `health`: the monitoring subsystem
//! - `api`: HTTP control surface
//! - `config`: service configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod health;
pub mod ingest;
pub mod lot;
pub mod registry;
pub mod reporter;
pub mod transport;
pub mod worker;

pub use config::MonitorConfig;
pub use detect::{FramePipeline, ProcessingParams, Stabilizer};
pub use frame::Frame;
pub use health::{HealthReport, SinkMonitor};
pub use ingest::{DefaultOpener, FrameSource, SourceOpener};
pub use lot::{ConfigError, LotConfig, LotConfigRequest};
pub use registry::{JobInfo, JobRegistry, JobSummary, StoppedJob};
pub use reporter::{Reporter, ReporterSettings, SubmitOutcome};
pub use transport::{HttpSink, MemorySink, ReportSink};
pub use worker::{CancelSignal, WorkerExit, WorkerSettings, WorkerState};

/// Identifier of a parking lot, as assigned by the backend.
pub type LotId = i64;

/// Identifier of a single parking spot within a lot.
pub type SpotId = i64;

/// Lower bound of a reported confidence value.
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Upper bound of a reported confidence value.
pub const MAX_CONFIDENCE: f32 = 0.99;

// -------------------- Regions --------------------

/// Pixel rectangle within a frame that covers one parking spot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub spot_id: SpotId,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(spot_id: SpotId, x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            spot_id,
            x,
            y,
            width,
            height,
        }
    }

    /// True when the whole rectangle lies inside a `frame_width` x `frame_height` frame.
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!(
            (right, bottom),
            (Some(r), Some(b)) if r <= frame_width && b <= frame_height
        )
    }
}

// -------------------- Classifications --------------------

/// Per-frame, per-region occupancy verdict before stabilization.
#[derive(Clone, Debug, PartialEq)]
pub struct RawClassification {
    pub spot_id: SpotId,
    pub occupied: bool,
    /// Always within `[MIN_CONFIDENCE, MAX_CONFIDENCE]`.
    pub confidence: f32,
    /// Foreground pixels counted inside the region.
    pub pixel_count: u32,
    pub observed_at: DateTime<Utc>,
}

/// Stabilized detection for one spot, in the shape the backend expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpotDetection {
    pub spot_id: SpotId,
    pub is_occupied: bool,
    pub confidence: f32,
    pub license_plate: Option<String>,
}

/// One report for one lot, sent to the result sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportBatch {
    pub lot_id: LotId,
    pub timestamp: DateTime<Utc>,
    /// Configuration generation that produced this batch.
    pub generation: u64,
    /// `started_at` of the job that produced this batch.
    pub started_at: DateTime<Utc>,
    pub detections: Vec<SpotDetection>,
}

impl ReportBatch {
    pub fn new(
        lot_id: LotId,
        generation: u64,
        started_at: DateTime<Utc>,
        detections: Vec<SpotDetection>,
    ) -> Self {
        Self {
            lot_id,
            timestamp: Utc::now(),
            generation,
            started_at,
            detections,
        }
    }
}

/// Confidence derived from how far a pixel count sits from the occupancy threshold.
pub fn occupancy_confidence(pixel_count: u32, threshold: u32) -> f32 {
    if threshold == 0 {
        return MAX_CONFIDENCE;
    }
    let distance = (pixel_count as f64 - threshold as f64).abs() / threshold as f64;
    (distance as f32).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}
