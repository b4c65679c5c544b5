//! Local file frame source.
//!
//! This module provides `FileSource` for reading frames from local storage:
//! - A single image file is served as a still feed (the same frame, repeatedly)
//! - A directory of image files is played in file-name order and ends after the
//!   last file; `rewind` restarts it
//!
//! The file source MUST NOT:
//! - Fetch remote URLs
//! - Write decoded frames back to disk

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use super::FrameSource;
use crate::frame::Frame;

const FRAME_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Local file frame source.
pub struct FileSource {
    locator: String,
    backend: Option<FileBackend>,
}

enum FileBackend {
    Still { image: RgbImage, sequence: u64 },
    Sequence { files: Vec<PathBuf>, position: usize },
}

impl FileSource {
    pub fn new(path: &str) -> Self {
        Self {
            locator: path.to_string(),
            backend: None,
        }
    }

    fn path(&self) -> &Path {
        Path::new(&self.locator)
    }
}

impl FrameSource for FileSource {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn connect(&mut self) -> Result<()> {
        let path = self.path().to_path_buf();
        let backend = if path.is_dir() {
            let files = list_frames(&path)?;
            if files.is_empty() {
                return Err(anyhow!("no image frames found in {}", path.display()));
            }
            log::info!(
                "FileSource: connected to {} ({} frames)",
                path.display(),
                files.len()
            );
            FileBackend::Sequence { files, position: 0 }
        } else {
            let image = image::open(&path)
                .with_context(|| format!("open video source {}", path.display()))?
                .into_rgb8();
            log::info!("FileSource: connected to {} (still image)", path.display());
            FileBackend::Still { image, sequence: 0 }
        };
        self.backend = Some(backend);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| anyhow!("file source not connected; call connect() first"))?;
        let frame = match backend {
            FileBackend::Still { image, sequence } => {
                *sequence += 1;
                Frame::new(image.clone(), *sequence)
            }
            FileBackend::Sequence { files, position } => loop {
                let Some(path) = files.get(*position) else {
                    return Err(anyhow!("end of stream after {} frames", files.len()));
                };
                *position += 1;
                let decoded = std::fs::read(path)
                    .with_context(|| format!("read frame {}", path.display()))
                    .and_then(|bytes| Frame::decode(&bytes, *position as u64));
                match decoded {
                    Ok(frame) => break frame,
                    Err(err) => log::warn!("FileSource: skipping {}: {:#}", path.display(), err),
                }
            },
        };
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<()> {
        match self.backend.as_mut() {
            Some(FileBackend::Sequence { position, .. }) => {
                *position = 0;
                Ok(())
            }
            Some(FileBackend::Still { .. }) => Ok(()),
            None => Err(anyhow!("file source not connected")),
        }
    }
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("list frames in {}", dir.display()))?
    {
        let path = entry?.path();
        let is_frame = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if path.is_file() && is_frame {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
