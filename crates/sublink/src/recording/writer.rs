//! Per-camera video file: concatenated JPEG frames, no container

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct MjpegWriter {
    file: BufWriter<File>,
    path: PathBuf,
    frame_count: u64,
    bytes_written: u64,
}

impl MjpegWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Never truncate an earlier recording
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create video file: {:?}", path))?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            frame_count: 0,
            bytes_written: 0,
        })
    }

    pub fn write_frame(&mut self, jpeg: &[u8]) -> Result<()> {
        self.file
            .write_all(jpeg)
            .with_context(|| format!("Failed to write frame to {:?}", self.path))?;
        self.frame_count += 1;
        self.bytes_written += jpeg.len() as u64;
        Ok(())
    }

    /// Flush and close. Returns the number of frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.file
            .flush()
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        Ok(self.frame_count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
