//! JPEG encoding of captured frames

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::RawFrame;

/// Turn a raw frame into JPEG bytes. Device-compressed frames pass through.
pub fn encode_jpeg(frame: RawFrame, quality: u8) -> Result<Bytes> {
    match frame {
        RawFrame::Jpeg(bytes) => {
            if !bytes.starts_with(&[0xFF, 0xD8]) {
                bail!("Device frame is not a JPEG");
            }
            Ok(bytes)
        }
        RawFrame::Rgb {
            width,
            height,
            data,
        } => encode_rgb(&data, width, height, quality),
        RawFrame::Yuyv {
            width,
            height,
            data,
        } => {
            let rgb = yuyv_to_rgb(&data, width, height)?;
            encode_rgb(&rgb, width, height, quality)
        }
    }
}

fn encode_rgb(data: &[u8], width: u32, height: u32, quality: u8) -> Result<Bytes> {
    let expected = width as usize * height as usize * 3;
    if data.len() != expected {
        bail!("RGB frame is {} bytes, expected {}", data.len(), expected);
    }
    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(data, width, height, ExtendedColorType::Rgb8)
        .context("JPEG encode failed")?;
    Ok(Bytes::from(out))
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if data.len() < pixels * 2 || width % 2 != 0 {
        bail!("Short or misaligned YUYV frame");
    }
    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    Ok(rgb)
}

// BT.601
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}
