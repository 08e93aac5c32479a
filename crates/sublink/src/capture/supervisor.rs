//! Capture state machine for one camera slot
//!
//! ```text
//! Opening ──probe ok──▶ Capturing ◀──read ok── Degraded
//!    │                     │ read fails           │ failures reach threshold
//!    │                     └──────────▶ Degraded  ▼
//!    └──probe fails──▶ Failed ──backoff──▶ Reopening ──ok──▶ Capturing
//!                        ▲                    │
//!                        └──────fails─────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{open_configured, CaptureDevice, DeviceOpener, RawFrame};
use super::slot::{CameraSlot, CameraState, FrameCache, SlotStatus};
use super::{encode_jpeg, pause, CaptureConfig};

/// Owns the device of one camera and drives it through [`CameraState`]
pub struct CaptureSupervisor {
    index: u32,
    config: CaptureConfig,
    opener: Arc<dyn DeviceOpener>,
    device: Option<Box<dyn CaptureDevice>>,
    state: CameraState,
    consecutive_failures: u32,
    cache: FrameCache,
    status_tx: watch::Sender<SlotStatus>,
}

impl CaptureSupervisor {
    /// Create the supervisor and the read-only slot handed to consumers
    pub fn new(index: u32, config: CaptureConfig, opener: Arc<dyn DeviceOpener>) -> (Self, CameraSlot) {
        let cache = FrameCache::new();
        let (status_tx, status_rx) = watch::channel(SlotStatus::default());
        let slot = CameraSlot {
            index,
            cache: cache.clone(),
            status: status_rx,
        };
        let supervisor = Self {
            index,
            config,
            opener,
            device: None,
            state: CameraState::Opening,
            consecutive_failures: 0,
            cache,
            status_tx,
        };
        (supervisor, slot)
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Advance the state machine once. Returns how long to wait before the
    /// next step.
    pub fn step(&mut self, cancel: &CancellationToken) -> Duration {
        match self.state {
            CameraState::Opening | CameraState::Reopening | CameraState::Failed => self.open(cancel),
            CameraState::Capturing | CameraState::Degraded => self.read(),
        }
    }

    /// Blocking capture loop; returns when cancelled
    pub fn run(mut self, cancel: CancellationToken) {
        info!(camera = self.index, "Capture loop started");
        loop {
            let wait = self.step(&cancel);
            if !pause(wait, self.config.poll_tick, &cancel) {
                break;
            }
        }
        self.device.take();
        info!(camera = self.index, "Capture loop stopped");
    }

    fn open(&mut self, cancel: &CancellationToken) -> Duration {
        if self.state == CameraState::Failed {
            self.set_state(CameraState::Reopening);
        }
        // Always a fresh device; the old one was released already
        self.device.take();

        match open_configured(self.opener.as_ref(), self.index, &self.config, cancel) {
            Ok((device, frame)) => {
                let backend = device.backend();
                self.device = Some(device);
                self.consecutive_failures = 0;
                self.status_tx.send_modify(|s| s.backend = Some(backend));
                self.set_state(CameraState::Capturing);
                if let Err(e) = self.store(frame) {
                    debug!(camera = self.index, "Probe frame not cached: {}", e);
                }
                self.config.frame_interval
            }
            Err(e) => {
                warn!(camera = self.index, "Camera open failed: {:#}", e);
                self.status_tx.send_modify(|s| s.backend = None);
                self.set_state(CameraState::Failed);
                self.config.failed_backoff
            }
        }
    }

    fn read(&mut self) -> Duration {
        let read = match self.device.as_mut() {
            Some(device) => device.read_frame(),
            None => Err(anyhow::anyhow!("No device")),
        };
        let result = read.and_then(|frame| self.encode(frame));

        match result {
            Ok(jpeg) => {
                self.cache.store(jpeg);
                if self.consecutive_failures > 0 || self.state != CameraState::Capturing {
                    info!(camera = self.index, "Capture recovered");
                }
                self.consecutive_failures = 0;
                self.set_state(CameraState::Capturing);
                self.config.frame_interval
            }
            Err(e) => {
                self.consecutive_failures += 1;
                debug!(
                    camera = self.index,
                    failures = self.consecutive_failures,
                    "Frame read failed: {:#}",
                    e
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        camera = self.index,
                        failures = self.consecutive_failures,
                        "Too many read failures, reopening camera"
                    );
                    self.device.take();
                    self.consecutive_failures = 0;
                    self.set_state(CameraState::Reopening);
                    self.config.reopen_delay
                } else {
                    self.set_state(CameraState::Degraded);
                    self.config.retry_interval
                }
            }
        }
    }

    fn encode(&self, frame: RawFrame) -> anyhow::Result<bytes::Bytes> {
        encode_jpeg(frame, self.config.jpeg_quality)
    }

    fn store(&self, frame: RawFrame) -> anyhow::Result<()> {
        self.cache.store(self.encode(frame)?);
        Ok(())
    }

    fn set_state(&mut self, state: CameraState) {
        self.state = state;
        let failures = self.consecutive_failures;
        self.status_tx.send_if_modified(|s| {
            let changed = s.state != state || s.consecutive_failures != failures;
            s.state = state;
            s.consecutive_failures = failures;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Backend, CaptureProperty};
    use anyhow::{bail, Result};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scripted read outcome
    #[derive(Clone, Copy)]
    enum Read {
        Frame(u8),
        Fail,
    }

    struct MockDevice {
        reads: Arc<Mutex<VecDeque<Read>>>,
    }

    impl CaptureDevice for MockDevice {
        fn backend(&self) -> Backend {
            Backend::TestPattern
        }

        fn set_property(&mut self, _property: CaptureProperty) -> Result<()> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RawFrame> {
            match self.reads.lock().unwrap().pop_front() {
                Some(Read::Frame(n)) => Ok(RawFrame::Jpeg(Bytes::from(vec![0xFF, 0xD8, n, 0xFF, 0xD9]))),
                Some(Read::Fail) | None => bail!("read failed"),
            }
        }
    }

    struct MockOpener {
        opens_ok: Mutex<VecDeque<bool>>,
        reads: Arc<Mutex<VecDeque<Read>>>,
    }

    impl DeviceOpener for MockOpener {
        fn backends(&self) -> Vec<Backend> {
            vec![Backend::TestPattern]
        }

        fn open(&self, _index: u32, _backend: Backend, _config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
            if self.opens_ok.lock().unwrap().pop_front().unwrap_or(false) {
                Ok(Box::new(MockDevice {
                    reads: self.reads.clone(),
                }))
            } else {
                bail!("open failed")
            }
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            probe_attempts: 2,
            probe_interval: Duration::ZERO,
            failure_threshold: 3,
            ..Default::default()
        }
    }

    fn supervisor(opens: &[bool], reads: &[Read]) -> (CaptureSupervisor, CameraSlot) {
        let opener = MockOpener {
            opens_ok: Mutex::new(opens.iter().copied().collect()),
            reads: Arc::new(Mutex::new(reads.iter().copied().collect())),
        };
        CaptureSupervisor::new(0, config(), Arc::new(opener))
    }

    #[test]
    fn test_probe_success_enters_capturing() {
        let cancel = CancellationToken::new();
        let (mut sup, slot) = supervisor(&[true], &[Read::Frame(1), Read::Frame(2)]);

        assert_eq!(sup.step(&cancel), config().frame_interval);
        assert_eq!(sup.state(), CameraState::Capturing);
        assert_eq!(slot.state(), CameraState::Capturing);
        assert_eq!(slot.cache.latest().unwrap()[2], 1);

        sup.step(&cancel);
        assert_eq!(slot.cache.latest().unwrap()[2], 2);
    }

    #[test]
    fn test_probe_failure_never_captures() {
        let cancel = CancellationToken::new();
        let (mut sup, slot) = supervisor(&[true], &[Read::Fail, Read::Fail]);

        assert_eq!(sup.step(&cancel), config().failed_backoff);
        assert_eq!(sup.state(), CameraState::Failed);
        assert!(!slot.cache.has_frame());
    }

    #[test]
    fn test_degraded_keeps_last_good_frame() {
        let cancel = CancellationToken::new();
        let (mut sup, slot) = supervisor(&[true], &[Read::Frame(7), Read::Fail, Read::Fail]);
        sup.step(&cancel);
        let good = slot.cache.latest().unwrap();

        assert_eq!(sup.step(&cancel), config().retry_interval);
        assert_eq!(sup.state(), CameraState::Degraded);
        assert_eq!(sup.consecutive_failures(), 1);
        sup.step(&cancel);
        assert_eq!(slot.status.borrow().consecutive_failures, 2);

        // Byte-identical frame still served
        assert_eq!(slot.cache.latest().unwrap(), good);
    }

    #[test]
    fn test_recovery_resets_failures() {
        let cancel = CancellationToken::new();
        let (mut sup, _slot) = supervisor(&[true], &[Read::Frame(1), Read::Fail, Read::Frame(2)]);
        sup.step(&cancel);
        sup.step(&cancel);
        assert_eq!(sup.state(), CameraState::Degraded);
        sup.step(&cancel);
        assert_eq!(sup.state(), CameraState::Capturing);
        assert_eq!(sup.consecutive_failures(), 0);
    }

    #[test]
    fn test_threshold_triggers_reopen_then_recovers() {
        let cancel = CancellationToken::new();
        let reads = [
            Read::Frame(1),
            Read::Fail,
            Read::Fail,
            Read::Fail,
            // After reopen: probe read
            Read::Frame(9),
        ];
        let (mut sup, slot) = supervisor(&[true, true], &reads);
        sup.step(&cancel);
        sup.step(&cancel);
        sup.step(&cancel);

        assert_eq!(sup.step(&cancel), config().reopen_delay);
        assert_eq!(sup.state(), CameraState::Reopening);
        // Reopening still serves the cached frame
        assert_eq!(slot.cache.latest().unwrap()[2], 1);

        sup.step(&cancel);
        assert_eq!(sup.state(), CameraState::Capturing);
        assert_eq!(slot.cache.latest().unwrap()[2], 9);
    }

    #[test]
    fn test_failed_reopen_backs_off_and_retries_forever() {
        let cancel = CancellationToken::new();
        let reads = [Read::Frame(1), Read::Fail, Read::Fail, Read::Fail, Read::Frame(5)];
        let (mut sup, slot) = supervisor(&[true, false, false, true], &reads);
        for _ in 0..4 {
            sup.step(&cancel);
        }
        assert_eq!(sup.state(), CameraState::Reopening);

        assert_eq!(sup.step(&cancel), config().failed_backoff);
        assert_eq!(sup.state(), CameraState::Failed);
        assert_eq!(slot.cache.latest().unwrap()[2], 1);

        sup.step(&cancel);
        assert_eq!(sup.state(), CameraState::Failed);

        sup.step(&cancel);
        assert_eq!(sup.state(), CameraState::Capturing);
        assert_eq!(slot.cache.latest().unwrap()[2], 5);
    }

    #[test]
    fn test_run_stops_on_cancel() {
        let (sup, slot) = supervisor(&[true], &[Read::Frame(1)]);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            std::thread::spawn(move || sup.run(cancel))
        };
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        handle.join().unwrap();
        assert!(slot.cache.has_frame());
    }
}
