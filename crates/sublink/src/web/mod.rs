//! Frame streaming server: axum HTTP over the camera caches.
//!
//! - `GET /video_feed_<n>`: multipart MJPEG stream of the n-th camera (1-based)
//! - `GET /status`: per-camera frame and capture state
//!
//! Handlers only read [`FrameCache`](crate::capture::FrameCache)s and slot
//! status; they never touch a device.

mod mjpeg;

pub use mjpeg::{mjpeg_part, mjpeg_stream, MJPEG_CONTENT_TYPE};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::capture::CameraSlot;
use crate::STREAM_FRAME_INTERVAL;

/// Streaming server settings
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub bind: SocketAddr,
    /// Pause between parts sent to one client
    pub frame_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::STREAM_PORT)),
            frame_interval: STREAM_FRAME_INTERVAL,
        }
    }
}

struct WebState {
    slots: Vec<CameraSlot>,
    frame_interval: Duration,
    cancel: CancellationToken,
    start_time: Instant,
}

/// Build the router. Streams end when `cancel` fires.
pub fn router(slots: Vec<CameraSlot>, frame_interval: Duration, cancel: CancellationToken) -> Router {
    let state = Arc::new(WebState {
        slots,
        frame_interval,
        cancel,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/status", get(status))
        .route("/{feed}", get(video_feed))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the listener for `config.bind`.
pub async fn bind(config: &StreamConfig) -> Result<TcpListener> {
    TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))
}

/// Serve on an already bound listener until cancelled.
pub async fn serve(
    listener: TcpListener,
    slots: Vec<CameraSlot>,
    frame_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    let cameras = slots.len();
    let app = router(slots, frame_interval, cancel.clone());

    info!(cameras, "Streaming server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")?;

    info!("Streaming server stopped");
    Ok(())
}

/// Parse `video_feed_<n>` into a 1-based feed number
fn parse_feed(segment: &str) -> Option<usize> {
    segment
        .strip_prefix("video_feed_")
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

/// GET /video_feed_<n>
async fn video_feed(State(state): State<Arc<WebState>>, Path(segment): Path<String>) -> Response {
    let Some(feed) = parse_feed(&segment) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    let Some(slot) = state.slots.get(feed - 1) else {
        let body = if state.slots.is_empty() {
            "No cameras available".to_string()
        } else {
            format!("Camera {} not available", feed)
        };
        return (StatusCode::NOT_FOUND, body).into_response();
    };

    debug!(feed, camera = slot.index, "Stream client connected");
    let stream = mjpeg_stream(slot.cache.clone(), state.frame_interval, state.cancel.clone());

    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// GET /status
async fn status(State(state): State<Arc<WebState>>) -> Json<serde_json::Value> {
    let available: Vec<u32> = state.slots.iter().map(|s| s.index).collect();
    let mut camera_status = serde_json::Map::new();

    for slot in &state.slots {
        let status = slot.status.borrow().clone();
        camera_status.insert(
            slot.index.to_string(),
            serde_json::json!({
                "has_recent_frame": slot.cache.has_frame(),
                "camera_active": status.state.is_active(),
                "state": status.state,
                "consecutive_failures": status.consecutive_failures,
                "backend": status.backend.map(|b| b.to_string()),
            }),
        );
    }

    Json(serde_json::json!({
        "available_cameras": available,
        "camera_status": camera_status,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraState, FrameCache, SlotStatus};
    use bytes::Bytes;
    use tokio::sync::watch;

    fn slot(index: u32, state: CameraState, frame: Option<&'static [u8]>) -> (CameraSlot, watch::Sender<SlotStatus>) {
        let cache = FrameCache::new();
        if let Some(frame) = frame {
            cache.store(Bytes::from_static(frame));
        }
        let (tx, rx) = watch::channel(SlotStatus {
            state,
            ..Default::default()
        });
        (
            CameraSlot {
                index,
                cache,
                status: rx,
            },
            tx,
        )
    }

    async fn spawn_server(slots: Vec<CameraSlot>) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, slots, Duration::from_millis(5), cancel.clone()));
        (format!("http://{}", addr), cancel)
    }

    #[tokio::test]
    async fn test_bind_reports_busy_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = StreamConfig {
            bind: taken.local_addr().unwrap(),
            ..Default::default()
        };
        assert!(bind(&config).await.is_err());
    }

    #[test]
    fn test_parse_feed() {
        assert_eq!(parse_feed("video_feed_1"), Some(1));
        assert_eq!(parse_feed("video_feed_12"), Some(12));
        assert_eq!(parse_feed("video_feed_0"), None);
        assert_eq!(parse_feed("video_feed_"), None);
        assert_eq!(parse_feed("favicon.ico"), None);
        assert_eq!(parse_feed("video_feed_+1"), None);
        assert_eq!(parse_feed("video_feed_-1"), None);
        assert_eq!(parse_feed("video_feed_ 1"), None);
    }

    #[tokio::test]
    async fn test_status_reports_each_camera() {
        let (a, _ta) = slot(0, CameraState::Capturing, Some(b"\xFF\xD8x\xFF\xD9"));
        let (b, _tb) = slot(2, CameraState::Failed, None);
        let (base, cancel) = spawn_server(vec![a, b]).await;

        let body = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(json["available_cameras"], serde_json::json!([0, 2]));
        assert_eq!(json["camera_status"]["0"]["has_recent_frame"], true);
        assert_eq!(json["camera_status"]["0"]["camera_active"], true);
        assert_eq!(json["camera_status"]["2"]["has_recent_frame"], false);
        assert_eq!(json["camera_status"]["2"]["camera_active"], false);
        assert_eq!(json["camera_status"]["2"]["state"], "failed");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_feed_is_404_text() {
        let (a, _ta) = slot(0, CameraState::Capturing, None);
        let (base, cancel) = spawn_server(vec![a]).await;

        let resp = reqwest::get(format!("{}/video_feed_2", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "Camera 2 not available");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_signed_feed_number_is_not_found() {
        let (a, _ta) = slot(0, CameraState::Capturing, Some(b"\xFF\xD8x\xFF\xD9"));
        let (base, cancel) = spawn_server(vec![a]).await;

        let resp = reqwest::get(format!("{}/video_feed_+1", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "Not found");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_no_cameras_message() {
        let (base, cancel) = spawn_server(vec![]).await;
        let resp = reqwest::get(format!("{}/video_feed_1", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "No cameras available");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_feed_streams_multipart_parts() {
        let frame: &'static [u8] = b"\xFF\xD8jpegdata\xFF\xD9";
        let (a, _ta) = slot(0, CameraState::Capturing, Some(frame));
        let (base, cancel) = spawn_server(vec![a]).await;

        let mut resp = reqwest::get(format!("{}/video_feed_1", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()[reqwest::header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let expected = mjpeg_part(frame);
        let mut received = Vec::new();
        while received.len() < expected.len() * 2 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received[..expected.len()], &expected[..]);
        assert_eq!(&received[expected.len()..expected.len() * 2], &expected[..]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_degraded_camera_serves_cached_frame() {
        let frame: &'static [u8] = b"\xFF\xD8last-good\xFF\xD9";
        let (a, _ta) = slot(0, CameraState::Degraded, Some(frame));
        let (base, cancel) = spawn_server(vec![a]).await;

        let mut resp = reqwest::get(format!("{}/video_feed_1", base)).await.unwrap();
        let expected = mjpeg_part(frame);
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = resp.chunk().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received[..expected.len()], &expected[..]);
        cancel.cancel();
    }
}
