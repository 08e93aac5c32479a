//! Synthetic camera for running without hardware

use anyhow::Result;
use std::time::{Duration, Instant};

use super::device::{Backend, CaptureDevice, CaptureProperty, DeviceOpener, RawFrame};
use super::CaptureConfig;

/// Moving gradient paced at the configured frame rate
pub struct TestPatternDevice {
    index: u32,
    width: u32,
    height: u32,
    frame_period: Duration,
    frame_num: u32,
    next_frame_at: Instant,
}

impl TestPatternDevice {
    pub fn new(index: u32, config: &CaptureConfig) -> Self {
        let mut device = Self {
            index,
            width: config.width.max(2),
            height: config.height.max(2),
            frame_period: Duration::ZERO,
            frame_num: 0,
            next_frame_at: Instant::now(),
        };
        device.set_fps(config.fps);
        device
    }

    fn set_fps(&mut self, fps: u32) {
        self.frame_period = Duration::from_micros(1_000_000 / fps.max(1) as u64);
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.frame_num as usize * 4;
        let tint = (self.index as u8).wrapping_mul(60);
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                data.push(((x + shift) * 255 / w) as u8);
                data.push((y * 255 / h) as u8);
                data.push(tint);
            }
        }
        data
    }
}

impl CaptureDevice for TestPatternDevice {
    fn backend(&self) -> Backend {
        Backend::TestPattern
    }

    fn set_property(&mut self, property: CaptureProperty) -> Result<()> {
        match property {
            CaptureProperty::Width(w) if w >= 2 => self.width = w,
            CaptureProperty::Height(h) if h >= 2 => self.height = h,
            CaptureProperty::Fps(fps) => self.set_fps(fps),
            // Format and exposure hints mean nothing to a synthetic source
            _ => {}
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        let now = Instant::now();
        if self.next_frame_at > now {
            std::thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + self.frame_period;

        let data = self.render();
        self.frame_num = self.frame_num.wrapping_add(1);
        Ok(RawFrame::Rgb {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// Opens a [`TestPatternDevice`] for every index
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPatternOpener;

impl DeviceOpener for TestPatternOpener {
    fn backends(&self) -> Vec<Backend> {
        vec![Backend::TestPattern]
    }

    fn open(&self, index: u32, _backend: Backend, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(TestPatternDevice::new(index, config)))
    }
}
