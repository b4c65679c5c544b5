//! classify_image - Run the occupancy pipeline on one image.
//!
//! Reads an image and a spot list, prints the detections as JSON, and
//! optionally writes the annotated image. Useful for tuning processing
//! parameters against a camera snapshot before configuring a lot.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use parking_monitor::{
    detect::{annotate, encode_jpeg},
    lot::SpotRequest,
    Frame, FramePipeline, LotConfigRequest, MonitorConfig, Stabilizer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Classify parking spots in a single image")]
struct Args {
    /// Image to classify (JPEG or PNG).
    #[arg(long)]
    image: PathBuf,

    /// JSON file with `[{"id": 1, "x": 10, "y": 20}, ...]`.
    #[arg(long)]
    spots: PathBuf,

    /// Write the annotated JPEG here.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Configuration file supplying processing parameters.
    #[arg(long, env = "PARKING_MONITOR_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = MonitorConfig::load_from(args.config.as_deref())?;

    let raw_spots = std::fs::read_to_string(&args.spots)
        .with_context(|| format!("read spots file {}", args.spots.display()))?;
    let parking_spots: Vec<SpotRequest> = serde_json::from_str(&raw_spots)
        .with_context(|| format!("parse spots file {}", args.spots.display()))?;
    let lot = LotConfigRequest {
        lot_id: 0,
        name: "classify_image".to_string(),
        location: String::new(),
        video_feed_url: args.image.display().to_string(),
        parking_spots,
    }
    .validate()?;

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("read image {}", args.image.display()))?;
    let frame = Frame::decode(&bytes, 1)?;

    let pipeline = FramePipeline::new(config.processing.clone());
    let regions = lot.regions(pipeline.params());
    let raw = pipeline.classify(&frame, &regions)?;
    let detections = Stabilizer::new(1).detections(&raw);

    let occupied = detections.iter().filter(|d| d.is_occupied).count();
    println!("{}", serde_json::to_string_pretty(&detections)?);
    eprintln!(
        "{} of {} spots occupied ({} skipped as out of bounds)",
        occupied,
        detections.len(),
        regions.len() - detections.len()
    );

    if let Some(path) = &args.output {
        let annotated = annotate(frame.image(), &regions, &detections);
        std::fs::write(path, encode_jpeg(&annotated)?)
            .with_context(|| format!("write annotated image {}", path.display()))?;
        eprintln!("annotated image written to {}", path.display());
    }
    Ok(())
}
