//! Multipart MJPEG body

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::FrameCache;

pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One part: `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    part.put_slice(HEAD);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Endless stream of the cache's latest frame, one part per `interval`.
///
/// Ticks with no frame yet emit nothing. Ends when `cancel` fires or the
/// client goes away (the body is dropped).
pub fn mjpeg_stream(
    cache: FrameCache,
    interval: Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold((cache, ticker, cancel), |(cache, mut ticker, cancel)| async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }
            if let Some(frame) = cache.latest() {
                let part = mjpeg_part(&frame);
                return Some((Ok(part), (cache, ticker, cancel)));
            }
        }
    })
}
