use anyhow::{anyhow, Result};
use chrono::Utc;
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::{occupancy_confidence, RawClassification, Region};

const DEFAULT_BLOCK_SIZE: u32 = 25;
const DEFAULT_THRESHOLD_CONSTANT: i32 = 16;
const DEFAULT_MEDIAN_SIZE: u32 = 5;
const DEFAULT_DILATION_ITERATIONS: u32 = 1;
const DEFAULT_EMPTY_THRESHOLD: u32 = 900;
const DEFAULT_SPOT_WIDTH: u32 = 103;
const DEFAULT_SPOT_HEIGHT: u32 = 43;

/// Sigma of the noise-suppression blur applied to the luminance channel.
const NOISE_BLUR_SIGMA: f32 = 1.0;

/// Tunables of the occupancy pipeline. Shared by every lot in a deployment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    /// Neighbourhood size of the adaptive threshold. Coerced to odd.
    pub block_size: u32,
    /// Subtracted from the local mean before comparison.
    pub threshold_constant: i32,
    /// Median filter size. Coerced to odd.
    pub median_size: u32,
    pub dilation_iterations: u32,
    /// Foreground pixel count at or above which a spot is occupied.
    pub empty_threshold: u32,
    pub spot_width: u32,
    pub spot_height: u32,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            threshold_constant: DEFAULT_THRESHOLD_CONSTANT,
            median_size: DEFAULT_MEDIAN_SIZE,
            dilation_iterations: DEFAULT_DILATION_ITERATIONS,
            empty_threshold: DEFAULT_EMPTY_THRESHOLD,
            spot_width: DEFAULT_SPOT_WIDTH,
            spot_height: DEFAULT_SPOT_HEIGHT,
        }
    }
}

impl ProcessingParams {
    pub fn validate(&self) -> Result<()> {
        if self.empty_threshold == 0 {
            return Err(anyhow!("empty_threshold must be greater than zero"));
        }
        if self.spot_width == 0 || self.spot_height == 0 {
            return Err(anyhow!("spot width and height must be greater than zero"));
        }
        Ok(())
    }

    pub fn odd_block_size(&self) -> u32 {
        make_odd(self.block_size)
    }

    pub fn odd_median_size(&self) -> u32 {
        make_odd(self.median_size)
    }
}

fn make_odd(value: u32) -> u32 {
    if value % 2 == 0 {
        value + 1
    } else {
        value
    }
}

/// Sigma OpenCV derives for a Gaussian kernel of the given size.
fn kernel_sigma(size: u32) -> f32 {
    (0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8).max(0.1)
}

/// Stateless frame classifier.
///
/// Luminance, blur, adaptive Gaussian threshold (inverted), median, dilation,
/// then a foreground count per region.
#[derive(Clone, Debug, Default)]
pub struct FramePipeline {
    params: ProcessingParams,
}

impl FramePipeline {
    pub fn new(params: ProcessingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ProcessingParams {
        &self.params
    }

    /// Classify every in-bounds region of `frame`.
    ///
    /// Regions that do not fit inside the frame are omitted from the result with a
    /// warning; they never fail the frame. An empty frame yields no classifications.
    pub fn classify(&self, frame: &Frame, regions: &[Region]) -> Result<Vec<RawClassification>> {
        self.params.validate()?;
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let mask = self.foreground_mask(&frame.luma());
        let observed_at = Utc::now();
        let threshold = self.params.empty_threshold;

        let mut out = Vec::with_capacity(regions.len());
        for region in regions {
            if !region.fits_within(mask.width(), mask.height()) {
                log::warn!(
                    "parking spot {} region is out of bounds for {}x{} frame",
                    region.spot_id,
                    mask.width(),
                    mask.height()
                );
                continue;
            }
            let count = count_foreground(&mask, region);
            out.push(RawClassification {
                spot_id: region.spot_id,
                occupied: count >= threshold,
                confidence: occupancy_confidence(count, threshold),
                pixel_count: count,
                observed_at,
            });
        }
        Ok(out)
    }

    /// Binary mask where 255 marks texture darker than its neighbourhood.
    pub fn foreground_mask(&self, luma: &GrayImage) -> GrayImage {
        let blurred = gaussian_blur_f32(luma, NOISE_BLUR_SIGMA);
        let local_mean = gaussian_blur_f32(&blurred, kernel_sigma(self.params.odd_block_size()));
        let constant = self.params.threshold_constant;

        let mut mask = GrayImage::new(blurred.width(), blurred.height());
        for (x, y, out) in mask.enumerate_pixels_mut() {
            let value = blurred.get_pixel(x, y)[0] as i32;
            let mean = local_mean.get_pixel(x, y)[0] as i32;
            *out = if value > mean - constant {
                Luma([0])
            } else {
                Luma([255])
            };
        }

        let radius = self.params.odd_median_size() / 2;
        let mut mask = median_filter(&mask, radius, radius);
        for _ in 0..self.params.dilation_iterations {
            mask = dilate(&mask, Norm::LInf, 1);
        }
        mask
    }
}

fn count_foreground(mask: &GrayImage, region: &Region) -> u32 {
    let mut count = 0u32;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            if mask.get_pixel(x, y)[0] != 0 {
                count += 1;
            }
        }
    }
    count
}
