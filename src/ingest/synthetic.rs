//! Synthetic lot footage (`stub://`).
//!
//! Renders a dark lot with a grid of parking bays. Occupied bays carry the striped
//! texture of a parked car; which bays are occupied shifts every
//! `SCENE_PERIOD_FRAMES` frames. Bays start at (10, 10) and repeat every 120 px
//! horizontally and 60 px vertically, each 103x43.
//!
//! Locator options (query string):
//! - `width`, `height`: frame size (default 640x480, each 1..=8192)
//! - `frames`: end the stream after this many frames (rewindable)

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use url::Url;

use super::FrameSource;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_DIMENSION: u32 = 8192;
const SCENE_PERIOD_FRAMES: u64 = 50;
const BAY_ORIGIN: u32 = 10;
const BAY_STRIDE_X: u32 = 120;
const BAY_STRIDE_Y: u32 = 60;
const BAY_WIDTH: u32 = 103;
const BAY_HEIGHT: u32 = 43;
const ASPHALT: i16 = 90;

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub locator: String,
    pub width: u32,
    pub height: u32,
    /// Stream length; `None` streams forever.
    pub frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            locator: "stub://lot".to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frames: None,
        }
    }
}

/// Synthetic frame source.
pub struct SyntheticSource {
    config: SyntheticConfig,
    connected: bool,
    position: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            connected: false,
            position: 0,
        }
    }

    pub fn from_locator(locator: &str) -> Result<Self> {
        let url = Url::parse(locator).with_context(|| format!("parse stub locator {}", locator))?;
        let mut config = SyntheticConfig {
            locator: locator.to_string(),
            ..SyntheticConfig::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => config.width = parse_query(&key, &value)?,
                "height" => config.height = parse_query(&key, &value)?,
                "frames" => config.frames = Some(parse_query(&key, &value)?),
                other => log::debug!("ignoring unknown stub option '{}'", other),
            }
        }
        for (name, value) in [("width", config.width), ("height", config.height)] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(anyhow!(
                    "stub option '{}' must be between 1 and {}, got {}",
                    name,
                    MAX_DIMENSION,
                    value
                ));
            }
        }
        Ok(Self::new(config))
    }

    /// Whether bay `index` holds a car at stream position `position`.
    pub fn bay_occupied(index: u32, position: u64) -> bool {
        let scene = position / SCENE_PERIOD_FRAMES;
        (index as u64 + scene) % 3 != 0
    }

    fn render(&self) -> RgbImage {
        let (width, height) = (self.config.width, self.config.height);
        let mut rng = rand::thread_rng();
        let mut img = RgbImage::from_fn(width, height, |_, _| {
            let v = (ASPHALT + rng.gen_range(-3i16..=3)) as u8;
            Rgb([v, v, v])
        });

        let cols = width.saturating_sub(BAY_ORIGIN) / BAY_STRIDE_X;
        let rows = height.saturating_sub(BAY_ORIGIN) / BAY_STRIDE_Y;
        for row in 0..rows {
            for col in 0..cols {
                let index = row * cols + col;
                if !Self::bay_occupied(index, self.position) {
                    continue;
                }
                let x0 = BAY_ORIGIN + col * BAY_STRIDE_X;
                let y0 = BAY_ORIGIN + row * BAY_STRIDE_Y;
                for y in y0..(y0 + BAY_HEIGHT).min(height) {
                    let v = if ((y - y0) / 4) % 2 == 0 { 30 } else { 220 };
                    for x in x0..(x0 + BAY_WIDTH).min(width) {
                        img.put_pixel(x, y, Rgb([v, v, v]));
                    }
                }
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn locator(&self) -> &str {
        &self.config.locator
    }

    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.locator);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if let Some(limit) = self.config.frames {
            if self.position >= limit {
                return Err(anyhow!("end of stream after {} frames", limit));
            }
        }
        self.position += 1;
        Ok(Frame::new(self.render(), self.position))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

fn parse_query<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub option '{}' has invalid value '{}'", key, value))
}
