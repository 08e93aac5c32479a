//! Capture device abstraction and the open/configure/probe sequence

use anyhow::{bail, Result};
use bytes::Bytes;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pause, CaptureConfig};

/// One frame as delivered by a device
#[derive(Debug, Clone)]
pub enum RawFrame {
    /// Already JPEG-compressed by the device
    Jpeg(Bytes),
    /// Packed 8-bit RGB
    Rgb { width: u32, height: u32, data: Vec<u8> },
    /// Packed YUYV 4:2:2
    Yuyv { width: u32, height: u32, data: Vec<u8> },
}

/// Device property applied after open. Each one is a hint; failure to apply
/// is logged and capture continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProperty {
    FourCc([u8; 4]),
    Width(u32),
    Height(u32),
    Fps(u32),
    BufferSize(u32),
    AutoExposure(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    V4l2,
    Ffmpeg,
    TestPattern,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::V4l2 => write!(f, "v4l2"),
            Backend::Ffmpeg => write!(f, "ffmpeg"),
            Backend::TestPattern => write!(f, "test-pattern"),
        }
    }
}

/// An open camera. Owned by exactly one capture loop.
pub trait CaptureDevice: Send {
    fn backend(&self) -> Backend;

    fn set_property(&mut self, property: CaptureProperty) -> Result<()>;

    /// Begin streaming once properties are applied
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the next frame or fail
    fn read_frame(&mut self) -> Result<RawFrame>;
}

/// Creates devices for a camera index
pub trait DeviceOpener: Send + Sync {
    /// Backends to try, preferred first
    fn backends(&self) -> Vec<Backend>;

    fn open(&self, index: u32, backend: Backend, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>>;
}

/// Opens real hardware: V4L2 when compiled in, then the ffmpeg subprocess
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl DeviceOpener for SystemOpener {
    fn backends(&self) -> Vec<Backend> {
        let mut backends = Vec::new();
        #[cfg(feature = "v4l2")]
        backends.push(Backend::V4l2);
        backends.push(Backend::Ffmpeg);
        backends
    }

    fn open(&self, index: u32, backend: Backend, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
        match backend {
            #[cfg(feature = "v4l2")]
            Backend::V4l2 => Ok(Box::new(super::V4l2Device::open(index, config)?)),
            Backend::Ffmpeg => Ok(Box::new(super::FfmpegDevice::open(index, config)?)),
            other => bail!("Backend {} is not available", other),
        }
    }
}

/// Properties requested for every camera
fn requested_properties(config: &CaptureConfig) -> [CaptureProperty; 6] {
    [
        CaptureProperty::FourCc(*b"MJPG"),
        CaptureProperty::Width(config.width),
        CaptureProperty::Height(config.height),
        CaptureProperty::Fps(config.fps),
        CaptureProperty::BufferSize(config.buffer_size),
        CaptureProperty::AutoExposure(config.auto_exposure),
    ]
}

fn configure(device: &mut dyn CaptureDevice, index: u32, config: &CaptureConfig) {
    for property in requested_properties(config) {
        if let Err(e) = device.set_property(property) {
            debug!(camera = index, ?property, "Property not applied: {}", e);
        }
    }
}

/// Open, configure and probe a camera.
///
/// Backends are tried in preference order. The probe reads up to
/// `probe_attempts` frames, `probe_interval` apart; the first good frame is
/// returned with the device. If none arrives the device is released.
pub fn open_configured(
    opener: &dyn DeviceOpener,
    index: u32,
    config: &CaptureConfig,
    cancel: &CancellationToken,
) -> Result<(Box<dyn CaptureDevice>, RawFrame)> {
    let mut device = None;
    for backend in opener.backends() {
        let attempt = opener.open(index, backend, config).and_then(|mut dev| {
            configure(dev.as_mut(), index, config);
            dev.start()?;
            Ok(dev)
        });
        match attempt {
            Ok(dev) => {
                device = Some(dev);
                break;
            }
            Err(e) => debug!(camera = index, %backend, "Open failed: {}", e),
        }
    }

    let Some(mut device) = device else {
        bail!("No backend could open camera {}", index);
    };

    for attempt in 0..config.probe_attempts {
        if attempt > 0 && !pause(config.probe_interval, config.poll_tick, cancel) {
            bail!("Cancelled while probing camera {}", index);
        }
        match device.read_frame() {
            Ok(frame) => {
                info!(camera = index, backend = %device.backend(), "Camera opened");
                return Ok((device, frame));
            }
            Err(e) => debug!(camera = index, attempt, "Probe read failed: {}", e),
        }
    }

    warn!(camera = index, "Camera produced no frames during probe");
    bail!("Camera {} produced no frames", index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ScriptedDevice {
        backend: Backend,
        reads_ok: bool,
        applied: Arc<Mutex<Vec<CaptureProperty>>>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn backend(&self) -> Backend {
            self.backend
        }

        fn set_property(&mut self, property: CaptureProperty) -> Result<()> {
            if let CaptureProperty::AutoExposure(_) = property {
                bail!("unsupported");
            }
            self.applied.lock().unwrap().push(property);
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RawFrame> {
            if self.reads_ok {
                Ok(RawFrame::Jpeg(Bytes::from_static(b"jpeg")))
            } else {
                bail!("no frame")
            }
        }
    }

    struct ScriptedOpener {
        fail_preferred: bool,
        reads_ok: bool,
        opens: AtomicU32,
        applied: Arc<Mutex<Vec<CaptureProperty>>>,
    }

    impl ScriptedOpener {
        fn new(fail_preferred: bool, reads_ok: bool) -> Self {
            Self {
                fail_preferred,
                reads_ok,
                opens: AtomicU32::new(0),
                applied: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DeviceOpener for ScriptedOpener {
        fn backends(&self) -> Vec<Backend> {
            vec![Backend::V4l2, Backend::Ffmpeg]
        }

        fn open(&self, _index: u32, backend: Backend, _config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if backend == Backend::V4l2 && self.fail_preferred {
                bail!("v4l2 unavailable");
            }
            Ok(Box::new(ScriptedDevice {
                backend,
                reads_ok: self.reads_ok,
                applied: self.applied.clone(),
            }))
        }
    }

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            probe_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_first_backend() {
        let opener = ScriptedOpener::new(false, true);
        let (device, _) =
            open_configured(&opener, 0, &fast_config(), &CancellationToken::new()).unwrap();
        assert_eq!(device.backend(), Backend::V4l2);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_falls_back_to_default_backend() {
        let opener = ScriptedOpener::new(true, true);
        let (device, _) =
            open_configured(&opener, 0, &fast_config(), &CancellationToken::new()).unwrap();
        assert_eq!(device.backend(), Backend::Ffmpeg);
    }

    #[test]
    fn test_rejected_property_is_skipped() {
        let opener = ScriptedOpener::new(false, true);
        open_configured(&opener, 0, &fast_config(), &CancellationToken::new()).unwrap();
        let applied = opener.applied.lock().unwrap();
        assert_eq!(applied.len(), 5);
        assert_eq!(applied[0], CaptureProperty::FourCc(*b"MJPG"));
        assert!(applied.contains(&CaptureProperty::Width(640)));
    }

    #[test]
    fn test_probe_failure_releases_device() {
        let opener = ScriptedOpener::new(false, false);
        let result = open_configured(&opener, 3, &fast_config(), &CancellationToken::new());
        assert!(result.is_err());
    }
}
