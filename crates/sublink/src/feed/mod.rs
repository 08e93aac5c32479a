//! Operator-side feed consumers
//!
//! One consumer per edge camera pulls `/video_feed_<n>`, splits the
//! multipart body into JPEG frames and hands each frame to:
//! - the camera's [`MjpegWriter`] while a recording is active
//! - the [`ObstacleDetector`] while detection is enabled for the camera
//!
//! Detection runs on the blocking pool, one frame at a time per camera;
//! frames arriving while it is busy are not queued.

mod multipart;

pub use multipart::{MultipartParser, MAX_PART_SIZE};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::detection::ObstacleDetector;
use crate::recording::{CameraRecorder, MjpegWriter, RecorderCommand};
use crate::{video_feed_path, UiEvent, UiEventSender, MJPEG_BOUNDARY};

/// Feed consumer settings
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Edge base URL, e.g. `http://192.168.1.50:5000`
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Wait between reconnect attempts
    pub reconnect_delay: Duration,
}

impl FeedConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Control side of a running consumer
#[derive(Debug, Clone)]
pub struct FeedHandle {
    camera: usize,
    recorder: CameraRecorder,
    detection: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl FeedHandle {
    /// 1-based feed number
    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn recorder(&self) -> &CameraRecorder {
        &self.recorder
    }

    pub fn set_detection(&self, enabled: bool) {
        self.detection.store(enabled, Ordering::Relaxed);
    }

    pub fn detection_enabled(&self) -> bool {
        self.detection.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

pub struct FeedConsumer {
    camera: usize,
    url: String,
    config: FeedConfig,
    client: reqwest::Client,
    commands: mpsc::UnboundedReceiver<RecorderCommand>,
    detection: Arc<AtomicBool>,
    detecting: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    detector: Arc<dyn ObstacleDetector>,
    events: UiEventSender,
    writer: Option<MjpegWriter>,
}

impl FeedConsumer {
    pub fn new(
        camera: usize,
        config: FeedConfig,
        detector: Arc<dyn ObstacleDetector>,
        events: UiEventSender,
    ) -> Result<(Self, FeedHandle)> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let (recorder, commands) = CameraRecorder::new(camera);
        let detection = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(false));

        let handle = FeedHandle {
            camera,
            recorder,
            detection: detection.clone(),
            connected: connected.clone(),
        };
        let consumer = Self {
            camera,
            url: format!("{}{}", config.base_url.trim_end_matches('/'), video_feed_path(camera)),
            config,
            client,
            commands,
            detection,
            detecting: Arc::new(AtomicBool::new(false)),
            connected,
            detector,
            events,
            writer: None,
        };
        Ok((consumer, handle))
    }

    /// Pull the feed until cancelled, reconnecting on errors.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(camera = self.camera, url = %self.url, "Feed consumer started");

        while !cancel.is_cancelled() {
            if let Err(e) = self.consume(&cancel).await {
                debug!(camera = self.camera, "Feed error: {:#}", e);
            }
            self.set_connected(false);
            if cancel.is_cancelled() {
                break;
            }

            let delay = tokio::time::sleep(self.config.reconnect_delay);
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut delay => break,
                    Some(command) = self.commands.recv() => self.apply(command),
                }
            }
        }

        self.close_writer();
        info!(camera = self.camera, "Feed consumer stopped");
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<()> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = self.client.get(&self.url).send() => r.context("Feed request failed")?,
        };
        if !response.status().is_success() {
            bail!("Feed returned {}", response.status());
        }

        self.set_connected(true);
        let body = response.bytes_stream();
        tokio::pin!(body);
        let mut parser = MultipartParser::new(MJPEG_BOUNDARY);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(command) = self.commands.recv() => self.apply(command),
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for frame in parser.push(&chunk) {
                            self.on_frame(frame);
                        }
                    }
                    Some(Err(e)) => return Err(e).context("Feed stream broke"),
                    None => bail!("Feed stream ended"),
                },
            }
        }
    }

    fn on_frame(&mut self, frame: bytes::Bytes) {
        if !frame.starts_with(&[0xFF, 0xD8]) {
            debug!(camera = self.camera, "Skipping non-JPEG part");
            return;
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_frame(&frame) {
                warn!(camera = self.camera, "Video write failed, stopping camera recording: {:#}", e);
                self.writer = None;
            }
        }

        if self.detection.load(Ordering::Relaxed)
            && self
                .detecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let detector = self.detector.clone();
            let detecting = self.detecting.clone();
            let events = self.events.clone();
            let camera = self.camera;
            tokio::task::spawn_blocking(move || {
                match detector.detect(&frame) {
                    Ok(result) => {
                        let _ = events.send(UiEvent::Detection { camera, result });
                    }
                    Err(e) => debug!(camera, "Detection failed: {:#}", e),
                }
                detecting.store(false, Ordering::Release);
            });
        }
    }

    fn apply(&mut self, command: RecorderCommand) {
        match command {
            RecorderCommand::Start(path) => {
                self.close_writer();
                match MjpegWriter::create(&path) {
                    Ok(writer) => {
                        info!(camera = self.camera, path = %path.display(), "Camera recording started");
                        self.writer = Some(writer);
                    }
                    Err(e) => warn!(camera = self.camera, "Cannot record camera: {:#}", e),
                }
            }
            RecorderCommand::Stop => self.close_writer(),
        }
    }

    fn close_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            let path = writer.path().to_path_buf();
            match writer.finish() {
                Ok(frames) => info!(camera = self.camera, frames, path = %path.display(), "Camera recording stopped"),
                Err(e) => warn!(camera = self.camera, "Failed to finish video file: {:#}", e),
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::Relaxed) != connected {
            let _ = self.events.send(UiEvent::FeedChanged {
                camera: self.camera,
                connected,
            });
        }
    }
}

/// Ask an edge node how many cameras it serves (`/status`).
pub async fn fetch_camera_count(base_url: &str, timeout: Duration) -> Result<usize> {
    let url = format!("{}/status", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let body = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to query {}", url))?
        .error_for_status()?
        .text()
        .await
        .context("Failed to read status body")?;
    let status: serde_json::Value = serde_json::from_str(&body).context("Invalid status JSON")?;
    status["available_cameras"]
        .as_array()
        .map(|cameras| cameras.len())
        .context("Status has no available_cameras list")
}

/// Spawn consumers for feeds `1..=count` on the tracker.
pub fn spawn_feeds(
    base_url: &str,
    count: usize,
    detector: Arc<dyn ObstacleDetector>,
    events: &UiEventSender,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Result<Vec<FeedHandle>> {
    let mut handles = Vec::with_capacity(count);
    for camera in 1..=count {
        let (consumer, handle) =
            FeedConsumer::new(camera, FeedConfig::new(base_url), detector.clone(), events.clone())?;
        tracker.spawn(consumer.run(cancel.clone()));
        handles.push(handle);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::NullDetector;
    use crate::ui_channel;

    #[tokio::test]
    async fn test_consumer_records_and_detects() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut events_rx) = ui_channel();
        let (mut consumer, handle) = FeedConsumer::new(
            1,
            FeedConfig::new("http://127.0.0.1:9"),
            Arc::new(NullDetector::default()),
            events,
        )
        .unwrap();

        let path = dir.path().join("cam1.mjpeg");
        consumer.apply(RecorderCommand::Start(path.clone()));
        handle.set_detection(true);

        consumer.on_frame(bytes::Bytes::from_static(b"\xFF\xD8one\xFF\xD9"));
        consumer.on_frame(bytes::Bytes::from_static(b"not a jpeg"));
        consumer.apply(RecorderCommand::Stop);

        assert_eq!(std::fs::read(&path).unwrap(), b"\xFF\xD8one\xFF\xD9");

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, UiEvent::Detection { camera: 1, .. }));
    }

    #[tokio::test]
    async fn test_feed_url_uses_one_based_path() {
        let (events, _rx) = ui_channel();
        let (consumer, handle) = FeedConsumer::new(
            2,
            FeedConfig::new("http://10.0.0.5:5000/"),
            Arc::new(NullDetector::default()),
            events,
        )
        .unwrap();
        assert_eq!(consumer.url, "http://10.0.0.5:5000/video_feed_2");
        assert_eq!(handle.camera(), 2);
        assert!(!handle.is_connected());
        assert!(handle.recorder().is_active());
    }

    #[tokio::test]
    async fn test_unreachable_edge_keeps_retrying_until_cancel() {
        let (events, _rx) = ui_channel();
        let mut config = FeedConfig::new("http://127.0.0.1:9");
        config.reconnect_delay = Duration::from_millis(10);
        let (consumer, handle) =
            FeedConsumer::new(1, config, Arc::new(NullDetector::default()), events).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_connected());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("consumer should stop")
            .unwrap();
    }
}
