//! Sublink Edge: vehicle-side node
//!
//! Captures every attached camera, serves them as MJPEG streams, answers
//! discovery queries and reports system telemetry to the operator that
//! last queried it.
//!
//! ## Usage
//!
//! ```bash
//! # Probe /dev/video0..9 and serve on port 5000
//! sublink-edge
//!
//! # Fixed camera list and device name
//! SUBLINK_CAMERAS=0,2 SUBLINK_DEVICE_NAME=rov-front sublink-edge
//!
//! # Synthetic cameras (build with --features test-source)
//! sublink-edge --test-source
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use sublink::capture::{discover_indices, CameraManager, CaptureConfig, DeviceOpener, SystemOpener};
use sublink::discovery::DiscoveryResponder;
use sublink::web::StreamConfig;
use sublink::{DISCOVERY_PORT, RECV_TIMEOUT, STREAM_FRAME_INTERVAL, STREAM_PORT};

/// Highest `/dev/videoN` index probed when no camera list is given
const MAX_CAMERA_PROBE: u32 = 10;

/// Edge configuration from environment/args
struct Config {
    device_name: String,
    discovery_port: u16,
    http_port: u16,
    /// Explicit camera indices; probed when unset
    cameras: Option<Vec<u32>>,
    capture: CaptureConfig,
    telemetry_interval: Duration,
    test_source: bool,
}

impl Config {
    fn from_env() -> Self {
        let device_name = std::env::var("SUBLINK_DEVICE_NAME").unwrap_or_else(|_| "RPi".to_string());

        let discovery_port: u16 = std::env::var("SUBLINK_DISCOVERY_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DISCOVERY_PORT);

        let http_port: u16 = std::env::var("SUBLINK_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(STREAM_PORT);

        let cameras = std::env::var("SUBLINK_CAMERAS").ok().map(|s| {
            s.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect::<Vec<u32>>()
        });

        let defaults = CaptureConfig::default();
        let capture = CaptureConfig {
            width: env_or("SUBLINK_WIDTH", defaults.width),
            height: env_or("SUBLINK_HEIGHT", defaults.height),
            fps: env_or("SUBLINK_FPS", defaults.fps),
            jpeg_quality: env_or("SUBLINK_JPEG_QUALITY", defaults.jpeg_quality).clamp(1, 100),
            ..defaults
        };

        let telemetry_interval = Duration::from_secs(env_or("SUBLINK_TELEMETRY_INTERVAL_SECS", 2u64).max(1));

        let test_source = std::env::args().any(|arg| arg == "--test-source");

        Self {
            device_name,
            discovery_port,
            http_port,
            cameras,
            capture,
            telemetry_interval,
            test_source,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(feature = "test-source")]
fn opener(test_source: bool) -> Arc<dyn DeviceOpener> {
    if test_source {
        info!("Using synthetic test cameras");
        Arc::new(sublink::capture::TestPatternOpener)
    } else {
        Arc::new(SystemOpener)
    }
}

#[cfg(not(feature = "test-source"))]
fn opener(test_source: bool) -> Arc<dyn DeviceOpener> {
    if test_source {
        warn!("--test-source requires the test-source feature, using real cameras");
    }
    Arc::new(SystemOpener)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Sublink Edge starting");
    info!("  Device name: {}", config.device_name);
    info!("  Discovery port: {}", config.discovery_port);
    info!("  HTTP port: {}", config.http_port);
    info!(
        "  Capture: {}x{} @ {}fps, JPEG quality {}",
        config.capture.width, config.capture.height, config.capture.fps, config.capture.jpeg_quality
    );

    // Sockets first; capture loops only stop on cancel
    let stream_config = StreamConfig {
        bind: SocketAddr::from(([0, 0, 0, 0], config.http_port)),
        frame_interval: STREAM_FRAME_INTERVAL,
    };
    let (responder, listener) = bind_endpoints(&config, &stream_config).await?;
    let responder = Arc::new(responder);

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Cameras
    let indices = match config.cameras.clone() {
        Some(indices) => indices,
        None => {
            let found = if config.test_source {
                vec![0, 1]
            } else {
                discover_indices(MAX_CAMERA_PROBE)
            };
            info!("  Discovered cameras: {:?}", found);
            found
        }
    };
    if indices.is_empty() {
        warn!("No cameras found; streams will answer 404");
    }
    let manager = CameraManager::start(
        &indices,
        &config.capture,
        opener(config.test_source),
        &tracker,
        &cancel,
    );

    // Discovery responder and telemetry reporter share one socket
    tracker.spawn(sublink::telemetry::system::run_reporter(
        responder.socket(),
        responder.operator(),
        config.telemetry_interval,
        cancel.clone(),
    ));
    let responder_cancel = cancel.clone();
    tracker.spawn(async move { responder.run(responder_cancel).await });

    // Streaming server
    let web_cancel = cancel.clone();
    let slots = manager.into_slots();
    tracker.spawn(async move {
        if let Err(e) = sublink::web::serve(listener, slots, stream_config.frame_interval, web_cancel.clone()).await {
            error!("Streaming server error: {:#}", e);
            web_cancel.cancel();
        }
    });

    tracker.close();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = cancel.cancelled() => warn!("A core task failed, shutting down"),
    }
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}

/// Bind the discovery socket and the HTTP listener.
async fn bind_endpoints(config: &Config, stream: &StreamConfig) -> Result<(DiscoveryResponder, TcpListener)> {
    let responder = DiscoveryResponder::bind(config.discovery_port, &config.device_name, RECV_TIMEOUT).await?;
    let listener = sublink::web::bind(stream).await?;
    Ok((responder, listener))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sublink=info".parse().unwrap())
                .add_directive("sublink_edge=info".parse().unwrap()),
        )
        .init();
}
