//! Recording session
//!
//! Starts and stops telemetry logging and per-camera video capture together.
//! Telemetry goes to `recording_<stamp>.csv` with a `Timestamp,Data` header;
//! each camera's feed consumer writes `recording_<stamp>_cam<n>.mjpeg`.

mod writer;

pub use writer::MjpegWriter;

use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::telemetry::TelemetryRecord;

/// Sessions started within one second before names run out
const MAX_STAMP_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording has not been started")]
    NotStarted,
    #[error("recording already active: {0}")]
    AlreadyActive(PathBuf),
    #[error("recording I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Instruction to a camera's video writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderCommand {
    /// Open this file and append every frame until stopped
    Start(PathBuf),
    Stop,
}

/// Command handle for one camera's video writer.
///
/// The camera counts as active while its consumer holds the receiver.
#[derive(Debug, Clone)]
pub struct CameraRecorder {
    camera: usize,
    commands: mpsc::UnboundedSender<RecorderCommand>,
}

impl CameraRecorder {
    pub fn new(camera: usize) -> (Self, mpsc::UnboundedReceiver<RecorderCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { camera, commands }, rx)
    }

    /// 1-based feed number
    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn is_active(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: RecorderCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

struct ActiveSession {
    started_at: DateTime<Local>,
    log_path: PathBuf,
    log: BufWriter<File>,
    writers: Vec<CameraRecorder>,
}

/// Coordinates one recording at a time
pub struct RecordingSession {
    dir: PathBuf,
    active: Option<ActiveSession>,
}

impl RecordingSession {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.active.as_ref().map(|s| s.started_at)
    }

    /// Path of the current telemetry log
    pub fn log_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|s| s.log_path.as_path())
    }

    /// Number of cameras told to record in the current session
    pub fn camera_count(&self) -> usize {
        self.active.as_ref().map_or(0, |s| s.writers.len())
    }

    /// Open the telemetry log and tell every active camera to start writing.
    pub fn start(&mut self, cameras: &[CameraRecorder]) -> Result<PathBuf, RecordingError> {
        if let Some(active) = &self.active {
            return Err(RecordingError::AlreadyActive(active.log_path.clone()));
        }

        fs::create_dir_all(&self.dir)?;

        let started_at = Local::now();
        let (stamp, log_path, file) = create_log(&self.dir, &started_at.format("%Y%m%d_%H%M%S").to_string())?;

        let mut log = BufWriter::new(file);
        log.write_all(b"Timestamp,Data\n")?;
        log.flush()?;

        let mut writers = Vec::new();
        for recorder in cameras.iter().filter(|r| r.is_active()) {
            let path = video_path(&self.dir, &stamp, recorder.camera());
            if recorder.send(RecorderCommand::Start(path)) {
                writers.push(recorder.clone());
            } else {
                warn!(camera = recorder.camera(), "Camera writer gone, not recording it");
            }
        }

        info!(path = %log_path.display(), cameras = writers.len(), "Recording started");

        self.active = Some(ActiveSession {
            started_at,
            log_path: log_path.clone(),
            log,
            writers,
        });
        Ok(log_path)
    }

    /// Close the telemetry log and tell every recording camera to stop.
    pub fn stop(&mut self) -> Result<PathBuf, RecordingError> {
        let mut session = self.active.take().ok_or(RecordingError::NotStarted)?;

        for recorder in &session.writers {
            recorder.send(RecorderCommand::Stop);
        }
        session.log.flush()?;

        info!(path = %session.log_path.display(), "Recording stopped");
        Ok(session.log_path)
    }

    /// Append one telemetry record as `(timestamp, raw packet)`.
    pub fn log_record(&mut self, record: &TelemetryRecord) -> Result<(), RecordingError> {
        let session = self.active.as_mut().ok_or(RecordingError::NotStarted)?;
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let row = format!("{},{}\n", csv_field(&timestamp), csv_field(record.raw()));
        session.log.write_all(row.as_bytes())?;
        session.log.flush()?;
        Ok(())
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.stop() {
                warn!("Failed to close recording on drop: {}", e);
            }
        }
    }
}

/// Create `recording_<stamp>.csv` without touching existing files. A
/// stamp already taken (same second) gets a `_<n>` suffix.
fn create_log(dir: &Path, base: &str) -> std::io::Result<(String, PathBuf, File)> {
    for n in 0..MAX_STAMP_SUFFIX {
        let stamp = if n == 0 {
            base.to_string()
        } else {
            format!("{}_{}", base, n)
        };
        let path = dir.join(format!("recording_{}.csv", stamp));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((stamp, path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free recording name for stamp {}", base),
    ))
}

/// Per-camera video file for a session stamp
pub fn video_path(dir: &Path, stamp: &str, camera: usize) -> PathBuf {
    dir.join(format!("recording_{}_cam{}.mjpeg", stamp, camera))
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
