use std::collections::HashMap;
use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::{Region, SpotDetection, SpotId};

const OCCUPIED_COLOR: Rgb<u8> = Rgb([200, 0, 0]);
const VACANT_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const OCCUPIED_THICKNESS: u32 = 2;
const VACANT_THICKNESS: u32 = 5;

/// Draw spot rectangles over a copy of `image`.
///
/// Occupied spots get a thin red outline, vacant spots a thick green one.
/// Regions without a detection (skipped as out of bounds) are not drawn.
pub fn annotate(image: &RgbImage, regions: &[Region], detections: &[SpotDetection]) -> RgbImage {
    let verdicts: HashMap<SpotId, bool> = detections
        .iter()
        .map(|d| (d.spot_id, d.is_occupied))
        .collect();

    let mut canvas = image.clone();
    for region in regions {
        let Some(occupied) = verdicts.get(&region.spot_id) else {
            continue;
        };
        let (color, thickness) = if *occupied {
            (OCCUPIED_COLOR, OCCUPIED_THICKNESS)
        } else {
            (VACANT_COLOR, VACANT_THICKNESS)
        };
        for inset in 0..thickness {
            let w = region.width.saturating_sub(inset * 2);
            let h = region.height.saturating_sub(inset * 2);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((region.x + inset) as i32, (region.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}

/// Encode an image as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, ImageFormat::Jpeg)
        .context("encode annotated frame as jpeg")?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(spot_id: SpotId, is_occupied: bool) -> SpotDetection {
        SpotDetection {
            spot_id,
            is_occupied,
            confidence: 0.9,
            license_plate: None,
        }
    }

    #[test]
    fn draws_outline_colours_by_verdict() {
        let base = RgbImage::from_pixel(200, 120, Rgb([10, 10, 10]));
        let regions = [
            Region::new(1, 5, 5, 50, 30),
            Region::new(2, 100, 50, 50, 30),
            Region::new(3, 190, 110, 50, 30),
        ];
        let out = annotate(&base, &regions, &[detection(1, true), detection(2, false)]);

        assert_eq!(out.get_pixel(5, 5), &OCCUPIED_COLOR);
        assert_eq!(out.get_pixel(100, 50), &VACANT_COLOR);
        assert_eq!(out.get_pixel(104, 54), &VACANT_COLOR);
        // interior untouched
        assert_eq!(out.get_pixel(30, 20), &Rgb([10, 10, 10]));
        // spot 3 had no detection
        assert_eq!(out.get_pixel(195, 115), &Rgb([10, 10, 10]));
    }

    #[test]
    fn jpeg_output_has_soi_marker() {
        let img = RgbImage::from_pixel(16, 16, Rgb([90, 90, 90]));
        let bytes = encode_jpeg(&img).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
