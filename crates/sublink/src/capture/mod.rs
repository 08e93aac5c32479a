//! Camera capture manager
//!
//! One supervised blocking loop per camera index:
//! - opens the device (preferred backend first, then the fallback)
//! - applies the capture configuration best-effort and probes for frames
//! - JPEG-encodes every good frame into the slot's shared cache
//! - reopens the device after sustained read failures
//!
//! Consumers only ever read the cache, so a stalled or unplugged camera
//! never blocks a stream; they keep seeing the last good frame.

mod device;
mod encode;
mod ffmpeg;
mod manager;
mod slot;
mod supervisor;
#[cfg(feature = "test-source")]
mod test_source;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use device::{
    open_configured, Backend, CaptureDevice, CaptureProperty, DeviceOpener, RawFrame, SystemOpener,
};
pub use encode::encode_jpeg;
pub use ffmpeg::FfmpegDevice;
pub use manager::{discover_indices, CameraManager};
pub use slot::{CameraSlot, CameraState, FrameCache, SlotStatus};
pub use supervisor::CaptureSupervisor;
#[cfg(feature = "test-source")]
pub use test_source::{TestPatternDevice, TestPatternOpener};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Capture configuration shared by every camera slot
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Driver-side frame queue depth
    pub buffer_size: u32,
    /// Auto-exposure hint; `false` requests manual exposure
    pub auto_exposure: bool,
    /// JPEG quality (1-100) for frames that arrive uncompressed
    pub jpeg_quality: u8,
    /// Reads attempted before a freshly opened device is given up on
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    /// Consecutive read failures that trigger a reopen
    pub failure_threshold: u32,
    /// Pause between retries while degraded
    pub retry_interval: Duration,
    /// Pause after releasing a device before reopening it
    pub reopen_delay: Duration,
    /// Pause after a failed reopen
    pub failed_backoff: Duration,
    /// Yield between successful reads
    pub frame_interval: Duration,
    /// Longest a single read may block before it counts as a failure
    pub read_timeout: Duration,
    /// Granularity of sleeps, so cancellation is noticed promptly
    pub poll_tick: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            buffer_size: 1,
            auto_exposure: false,
            jpeg_quality: 70,
            probe_attempts: 5,
            probe_interval: Duration::from_millis(500),
            failure_threshold: 10,
            retry_interval: Duration::from_millis(100),
            reopen_delay: Duration::from_secs(2),
            failed_backoff: Duration::from_secs(5),
            frame_interval: Duration::from_millis(10),
            read_timeout: Duration::from_secs(2),
            poll_tick: Duration::from_millis(50),
        }
    }
}

/// Sleep for `duration` in `tick`-sized slices. Returns `false` if cancelled.
pub(crate) fn pause(duration: Duration, tick: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(tick));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_completes() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert!(pause(Duration::from_millis(30), Duration::from_millis(5), &cancel));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pause_observes_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.cancel();
        });
        let start = Instant::now();
        assert!(!pause(Duration::from_secs(10), Duration::from_millis(5), &cancel));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_default_matches_camera_profile() {
        let config = CaptureConfig::default();
        assert_eq!((config.width, config.height, config.fps), (640, 480, 15));
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.failure_threshold, 10);
    }
}
