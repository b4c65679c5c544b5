//! GStreamer-backed frame source (feature: source-gstreamer).
//!
//! RTSP locators go through `rtspsrc`; every other URI goes through
//! `uridecodebin`. Frames come out of an `appsink` as packed RGB.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::FrameSource;
use crate::frame::Frame;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// GStreamer decoding pipeline ending in an RGB appsink.
pub struct GstreamerSource {
    locator: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(locator: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let head = if locator.starts_with("rtsp://") || locator.starts_with("rtsps://") {
            format!("rtspsrc location={} latency=0 ! decodebin", locator)
        } else {
            format!("uridecodebin uri={}", locator)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            head
        );
        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build pipeline for {}", locator))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("pipeline for {} is not a Pipeline", locator))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        Ok(Self {
            locator: locator.to_string(),
            pipeline,
            appsink,
            frame_count: 0,
            last_error: None,
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for GstreamerSource {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start pipeline for {}", self.locator))?;
        self.last_error = None;
        log::info!("GstreamerSource: connected to {}", self.locator);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                FRAME_TIMEOUT.as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("stream {} stalled", self.locator))?;
        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels, self.frame_count)
    }

    fn rewind(&mut self) -> Result<()> {
        self.pipeline
            .seek_simple(
                gstreamer::SeekFlags::FLUSH | gstreamer::SeekFlags::KEY_UNIT,
                gstreamer::ClockTime::ZERO,
            )
            .with_context(|| format!("seek {} to start", self.locator))?;
        self.last_error = None;
        Ok(())
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop pipeline for {}: {}", self.locator, err);
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("sample buffer is shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("sample row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
