//! Decoded video frames.
//!
//! - `Frame`: owned RGB pixels plus capture metadata, produced by the ingest layer.
//!
//! Frames are owned by the worker that pulled them and dropped after the frame
//! pipeline has run. Nothing in the crate stores frames beyond one loop iteration,
//! except the most recent frame kept for debug annotation.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};

/// One decoded frame from a video source.
pub struct Frame {
    image: RgbImage,

    /// Position of this frame in its source (1-based, resets on rewind).
    pub sequence: u64,

    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// Build a frame from packed RGB8 bytes.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>, sequence: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer has {} bytes, expected {} for {}x{} RGB",
                data.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    /// Decode an encoded image (JPEG, PNG) into a frame.
    pub fn decode(bytes: &[u8], sequence: u64) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| anyhow!("decode frame: {}", e))?
            .into_rgb8();
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Single luminance channel of this frame.
    pub fn luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_mismatched_buffer() {
        assert!(Frame::from_rgb(4, 4, vec![0u8; 10], 1).is_err());
        let frame = Frame::from_rgb(4, 2, vec![7u8; 24], 1).unwrap();
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
        assert!(!frame.is_empty());
    }

    #[test]
    fn luma_keeps_dimensions() {
        let frame = Frame::new(RgbImage::from_pixel(8, 6, image::Rgb([200, 200, 200])), 1);
        let luma = frame.luma();
        assert_eq!(luma.dimensions(), (8, 6));
        assert_eq!(luma.get_pixel(3, 3)[0], 200);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Frame::decode(b"not an image", 1).is_err());
    }
}
