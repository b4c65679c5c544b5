mod annotate;
mod pipeline;
mod stabilizer;

pub use annotate::{annotate, encode_jpeg};
pub use pipeline::{FramePipeline, ProcessingParams};
pub use stabilizer::{Stabilizer, DEFAULT_WINDOW};
