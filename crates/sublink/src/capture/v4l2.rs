//! Direct V4L2 capture through memory-mapped buffers

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};
use tracing::debug;

use super::device::{Backend, CaptureDevice, CaptureProperty, RawFrame};
use super::CaptureConfig;

/// V4L2_CID_EXPOSURE_AUTO
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

pub struct V4l2Device {
    index: u32,
    device: Device,
    buffer_count: u32,
    read_timeout: std::time::Duration,
    stream: Option<MmapStream<'static>>,
}

impl V4l2Device {
    pub fn open(index: u32, config: &CaptureConfig) -> Result<Self> {
        let device = Device::new(index as usize)
            .with_context(|| format!("Failed to open /dev/video{}", index))?;
        Ok(Self {
            index,
            device,
            buffer_count: config.buffer_size.max(1),
            read_timeout: config.read_timeout,
            stream: None,
        })
    }

    fn update_format(&self, apply: impl FnOnce(&mut v4l::Format)) -> Result<()> {
        let mut format = self.device.format().context("Failed to read format")?;
        apply(&mut format);
        let actual = self
            .device
            .set_format(&format)
            .context("Failed to set format")?;
        debug!(
            camera = self.index,
            "Format now {}x{} {}", actual.width, actual.height, actual.fourcc
        );
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    fn backend(&self) -> Backend {
        Backend::V4l2
    }

    fn set_property(&mut self, property: CaptureProperty) -> Result<()> {
        match property {
            CaptureProperty::FourCc(code) => self.update_format(|f| f.fourcc = FourCC::new(&code)),
            CaptureProperty::Width(width) => self.update_format(|f| f.width = width),
            CaptureProperty::Height(height) => self.update_format(|f| f.height = height),
            CaptureProperty::Fps(fps) => {
                self.device
                    .set_params(&Parameters::with_fps(fps))
                    .context("Failed to set frame rate")?;
                Ok(())
            }
            CaptureProperty::BufferSize(count) => {
                self.buffer_count = count.max(1);
                Ok(())
            }
            CaptureProperty::AutoExposure(auto) => {
                let mode = if auto {
                    EXPOSURE_APERTURE_PRIORITY
                } else {
                    EXPOSURE_MANUAL
                };
                self.device
                    .set_control(Control {
                        id: CID_EXPOSURE_AUTO,
                        value: Value::Integer(mode),
                    })
                    .context("Failed to set exposure mode")
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .context("Failed to create mmap stream")?;
        stream.set_timeout(self.read_timeout);
        self.stream = Some(stream);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        let format = self.device.format().context("Failed to read format")?;
        let stream = self.stream.as_mut().context("V4L2 stream not started")?;
        let (buf, meta) = stream.next().context("Failed to dequeue buffer")?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            bail!("Empty buffer");
        }
        let data = &buf[..used];

        match &format.fourcc.repr {
            b"MJPG" | b"JPEG" => Ok(RawFrame::Jpeg(Bytes::copy_from_slice(data))),
            b"YUYV" => Ok(RawFrame::Yuyv {
                width: format.width,
                height: format.height,
                data: data.to_vec(),
            }),
            other => bail!("Unsupported pixel format {}", String::from_utf8_lossy(other)),
        }
    }
}
