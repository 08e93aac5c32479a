//! Default capture backend: an `ffmpeg` subprocess reading the V4L2 node
//! and writing fixed-size RGB frames to stdout.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;
use tracing::{debug, info};

use super::device::{Backend, CaptureDevice, CaptureProperty, RawFrame};
use super::CaptureConfig;

pub struct FfmpegDevice {
    index: u32,
    device_path: PathBuf,
    width: u32,
    height: u32,
    fps: u32,
    input_format: Option<&'static str>,
    read_timeout: Duration,
    child: Option<Child>,
    frames: Option<Receiver<Vec<u8>>>,
}

impl FfmpegDevice {
    /// Check the device node exists. The subprocess starts on [`CaptureDevice::start`].
    pub fn open(index: u32, config: &CaptureConfig) -> Result<Self> {
        let device_path = PathBuf::from(format!("/dev/video{}", index));
        if !device_path.exists() {
            bail!("{} does not exist", device_path.display());
        }
        Ok(Self {
            index,
            device_path,
            width: config.width,
            height: config.height,
            fps: config.fps,
            input_format: None,
            read_timeout: config.read_timeout,
            child: None,
            frames: None,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn args(&self) -> Vec<String> {
        build_args(
            &self.device_path,
            self.input_format,
            self.width,
            self.height,
            self.fps,
        )
    }

    fn stop(&mut self) {
        self.frames.take();
        if let Some(mut child) = self.child.take() {
            debug!(camera = self.index, "Stopping ffmpeg capture");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn build_args(
    device: &Path,
    input_format: Option<&str>,
    width: u32,
    height: u32,
    fps: u32,
) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "v4l2".to_string(),
    ];
    if let Some(format) = input_format {
        args.push("-input_format".to_string());
        args.push(format.to_string());
    }
    args.extend([
        "-video_size".to_string(),
        format!("{}x{}", width, height),
        "-framerate".to_string(),
        fps.to_string(),
        "-i".to_string(),
        device.display().to_string(),
        // Force the output size so every frame has a known length
        "-vf".to_string(),
        format!("scale={}:{}", width, height),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-".to_string(),
    ]);
    args
}

/// Read exact-size frames until EOF or until the receiver is gone
fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: SyncSender<Vec<u8>>) {
    let mut count = 0u64;
    loop {
        let mut frame = vec![0u8; frame_len];
        if let Err(e) = stdout.read_exact(&mut frame) {
            debug!("ffmpeg stream ended after {} frames: {}", count, e);
            break;
        }
        count += 1;
        if tx.send(frame).is_err() {
            break;
        }
    }
}

impl CaptureDevice for FfmpegDevice {
    fn backend(&self) -> Backend {
        Backend::Ffmpeg
    }

    fn set_property(&mut self, property: CaptureProperty) -> Result<()> {
        match property {
            CaptureProperty::FourCc(fourcc) => {
                self.input_format = match &fourcc {
                    b"MJPG" => Some("mjpeg"),
                    b"YUYV" => Some("yuyv422"),
                    _ => bail!("Unsupported fourcc {:?}", String::from_utf8_lossy(&fourcc)),
                };
            }
            CaptureProperty::Width(w) if w > 0 => self.width = w,
            CaptureProperty::Height(h) if h > 0 => self.height = h,
            CaptureProperty::Fps(fps) if fps > 0 => self.fps = fps,
            other => bail!("{:?} not supported by the ffmpeg backend", other),
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.stop();

        let args = self.args();
        info!(
            camera = self.index,
            "Starting ffmpeg: {}x{} @ {}fps", self.width, self.height, self.fps
        );
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg. Is it installed?")?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture stdout from ffmpeg")?;

        // Depth 1: a slow consumer sees the newest frame, not a backlog
        let (tx, rx) = sync_channel(1);
        let frame_len = self.frame_len();
        std::thread::Builder::new()
            .name(format!("ffmpeg-cam{}", self.index))
            .spawn(move || read_frames(stdout, frame_len, tx))
            .context("Failed to spawn ffmpeg reader thread")?;

        self.child = Some(child);
        self.frames = Some(rx);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame> {
        let frames = self.frames.as_ref().context("ffmpeg capture not started")?;
        match frames.recv_timeout(self.read_timeout) {
            Ok(data) => Ok(RawFrame::Rgb {
                width: self.width,
                height: self.height,
                data,
            }),
            Err(RecvTimeoutError::Timeout) => bail!("Timed out waiting for a frame"),
            Err(RecvTimeoutError::Disconnected) => bail!("ffmpeg exited"),
        }
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
