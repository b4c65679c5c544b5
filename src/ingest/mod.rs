//! Frame ingestion sources.
//!
//! This module provides the sources a lot worker can pull frames from:
//! - Synthetic lot footage (`stub://`), for tests and demos
//! - Local image files or directories of frames
//! - HTTP MJPEG streams and JPEG snapshot endpoints
//! - RTSP and other URIs through GStreamer (feature: source-gstreamer)
//!
//! All sources produce `Frame` instances. A source handle is owned by exactly one
//! worker and released when dropped.
//!
//! Sources MUST NOT:
//! - Store decoded frames to disk
//! - Retain frames beyond handoff to the worker

use anyhow::{anyhow, Result};

pub mod file;
#[cfg(feature = "source-gstreamer")]
pub mod gst;
pub mod mjpeg;
pub mod synthetic;

pub use file::FileSource;
#[cfg(feature = "source-gstreamer")]
pub use gst::GstreamerSource;
pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;

use crate::frame::Frame;

/// A video source a worker reads frames from.
pub trait FrameSource: Send {
    /// Locator this source was opened from.
    fn locator(&self) -> &str;

    /// Open the underlying stream. Called once before the first `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Read the next frame. An error means end of stream or a transient failure.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Reposition to the start of the stream. Sources that cannot seek return an error.
    fn rewind(&mut self) -> Result<()> {
        Err(anyhow!("{} does not support seeking", self.locator()))
    }
}

/// Opens connected sources for a locator. Workers hold one of these so tests can
/// substitute scripted sources.
pub trait SourceOpener: Send + Sync {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>>;
}

/// Opener that picks a backend from the locator scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        let mut source = source_for(locator)?;
        source.connect()?;
        Ok(source)
    }
}

/// Build an unconnected source for `locator`.
pub fn source_for(locator: &str) -> Result<Box<dyn FrameSource>> {
    let locator = locator.trim();
    if locator.is_empty() {
        return Err(anyhow!("video source locator is empty"));
    }
    if locator.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_locator(locator)?));
    }
    if locator.starts_with("http://") || locator.starts_with("https://") {
        return Ok(Box::new(MjpegSource::new(locator)));
    }
    if locator.contains("://") {
        #[cfg(feature = "source-gstreamer")]
        {
            return Ok(Box::new(GstreamerSource::new(locator)?));
        }
        #[cfg(not(feature = "source-gstreamer"))]
        {
            return Err(anyhow!(
                "{} requires the source-gstreamer feature",
                locator.split("://").next().unwrap_or("this scheme")
            ));
        }
    }
    Ok(Box::new(FileSource::new(locator)))
}
