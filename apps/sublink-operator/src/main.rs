//! Sublink Operator: surface station
//!
//! Broadcasts for edge devices, tracks their liveness, ingests telemetry,
//! pulls every camera feed of the first device found and records sessions.
//! UI events are printed to stdout as JSON lines; commands are read from
//! stdin, one per line.
//!
//! ## Usage
//!
//! ```bash
//! # Discover on the default subnet
//! sublink-operator
//!
//! # Other subnet, recordings under /data/dives
//! SUBLINK_BROADCAST_ADDR=10.0.0.255 SUBLINK_RECORD_DIR=/data/dives sublink-operator
//! ```
//!
//! Commands: `record start`, `record stop`, `detect on <n>`,
//! `detect off <n>`, `refresh`.

use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use sublink::detection::{NullDetector, ObstacleDetector};
use sublink::discovery::{DiscoveryConfig, DiscoveryEngine};
use sublink::feed::{fetch_camera_count, spawn_feeds, FeedHandle};
use sublink::recording::{CameraRecorder, RecordingSession};
use sublink::telemetry::InboundTelemetry;
use sublink::{ui_channel, OperatorCommand, UiEvent, UiEventSender, DISCOVERY_PORT, STREAM_PORT};

/// Operator configuration from environment
struct Config {
    discovery: DiscoveryConfig,
    http_port: u16,
    record_dir: PathBuf,
    /// Feeds to open when the device's `/status` cannot be read
    feed_count: usize,
}

impl Config {
    fn from_env() -> Self {
        let defaults = DiscoveryConfig::default();

        let broadcast_addr: IpAddr = std::env::var("SUBLINK_BROADCAST_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.broadcast_addr);

        let port: u16 = std::env::var("SUBLINK_DISCOVERY_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DISCOVERY_PORT);

        let liveness_timeout = std::env::var("SUBLINK_LIVENESS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.liveness_timeout);

        let liveness_interval = std::env::var("SUBLINK_LIVENESS_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.liveness_interval);

        let http_port: u16 = std::env::var("SUBLINK_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(STREAM_PORT);

        let record_dir = std::env::var("SUBLINK_RECORD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("records"));

        let feed_count: usize = std::env::var("SUBLINK_FEED_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        Self {
            discovery: DiscoveryConfig {
                port,
                broadcast_addr,
                liveness_timeout,
                liveness_interval,
                ..defaults
            },
            http_port,
            record_dir,
            feed_count,
        }
    }
}

/// Everything the operator loop owns
struct OperatorContext {
    engine: DiscoveryEngine,
    session: RecordingSession,
    feeds: Vec<FeedHandle>,
    /// Device whose feeds are (being) consumed
    feed_device: Option<IpAddr>,
    detector: Arc<dyn ObstacleDetector>,
    events: UiEventSender,
    http_port: u16,
    feed_count: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl OperatorContext {
    async fn on_command(&mut self, command: OperatorCommand) {
        debug!(%command, "Operator command");
        match command {
            OperatorCommand::StartRecording => {
                let recorders: Vec<CameraRecorder> = self.feeds.iter().map(|f| f.recorder().clone()).collect();
                match self.session.start(&recorders) {
                    Ok(log_path) => {
                        let _ = self.events.send(UiEvent::RecordingChanged {
                            active: true,
                            log_path: Some(log_path),
                        });
                    }
                    Err(e) => warn!("Cannot start recording: {}", e),
                }
            }
            OperatorCommand::StopRecording => match self.session.stop() {
                Ok(log_path) => {
                    let _ = self.events.send(UiEvent::RecordingChanged {
                        active: false,
                        log_path: Some(log_path),
                    });
                }
                Err(e) => warn!("Cannot stop recording: {}", e),
            },
            OperatorCommand::EnableDetection(camera) | OperatorCommand::DisableDetection(camera) => {
                let enabled = matches!(command, OperatorCommand::EnableDetection(_));
                match self.feeds.iter().find(|f| f.camera() == camera) {
                    Some(feed) => {
                        feed.set_detection(enabled);
                        info!(camera, enabled, "Obstacle detection toggled");
                    }
                    None => warn!(camera, "No such feed"),
                }
            }
            OperatorCommand::RefreshDevices => {
                announce(&self.engine).await;
            }
        }
    }

    fn on_telemetry(&mut self, inbound: InboundTelemetry) {
        if self.session.is_active() {
            if let Err(e) = self.session.log_record(&inbound.record) {
                warn!("Failed to log telemetry: {}", e);
            }
        }
        let _ = self.events.send(UiEvent::Telemetry {
            address: inbound.from,
            record: inbound.record,
        });
    }

    /// Start consuming the feeds of the first device found.
    fn on_device_found(&mut self, address: IpAddr, feeds_tx: mpsc::UnboundedSender<Vec<FeedHandle>>) {
        if self.feed_device.is_some() {
            return;
        }
        self.feed_device = Some(address);

        let base_url = format!("http://{}:{}", address, self.http_port);
        let fallback = self.feed_count;
        let detector = self.detector.clone();
        let events = self.events.clone();
        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let count = match fetch_camera_count(&base_url, Duration::from_secs(3)).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Could not read camera count from {}: {:#}; assuming {}", base_url, e, fallback);
                    fallback
                }
            };
            info!(%base_url, feeds = count, "Opening camera feeds");
            match spawn_feeds(&base_url, count, detector, &events, &tracker, &cancel) {
                Ok(handles) => {
                    let _ = feeds_tx.send(handles);
                }
                Err(e) => error!("Failed to start feed consumers: {:#}", e),
            }
        });
    }
}

/// Broadcast the discovery query; a failed send is only logged.
async fn announce(engine: &DiscoveryEngine) -> bool {
    match engine.broadcast_discovery().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Discovery broadcast failed: {:#}", e);
            false
        }
    }
}

/// Read commands from stdin on a plain thread; the process may exit while it blocks.
fn spawn_command_reader() -> mpsc::UnboundedReceiver<OperatorCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<OperatorCommand>() {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{}", e),
            }
        }
    });
    rx
}

fn print_event(event: &UiEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode UI event: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Sublink Operator starting");
    info!("  Broadcast: {}", config.discovery.broadcast_target());
    info!("  Liveness timeout: {:?}", config.discovery.liveness_timeout);
    info!("  Recordings: {:?}", config.record_dir);

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (events, mut events_rx) = ui_channel();
    let (engine, mut telemetry_rx) = DiscoveryEngine::bind(config.discovery.clone(), events.clone()).await?;

    let listener = engine.clone();
    let listener_cancel = cancel.clone();
    tracker.spawn(async move { listener.run_listener(listener_cancel).await });

    let liveness = engine.clone();
    let liveness_cancel = cancel.clone();
    tracker.spawn(async move { liveness.run_liveness(liveness_cancel).await });

    // The link may not be up yet; `refresh` retries
    announce(&engine).await;

    let mut commands = spawn_command_reader();
    let (feeds_tx, mut feeds_rx) = mpsc::unbounded_channel::<Vec<FeedHandle>>();

    let mut ctx = OperatorContext {
        engine,
        session: RecordingSession::new(&config.record_dir),
        feeds: Vec::new(),
        feed_device: None,
        detector: Arc::new(NullDetector::default()),
        events,
        http_port: config.http_port,
        feed_count: config.feed_count,
        tracker: tracker.clone(),
        cancel: cancel.clone(),
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(command) = commands.recv() => ctx.on_command(command).await,
            Some(inbound) = telemetry_rx.recv() => ctx.on_telemetry(inbound),
            Some(handles) = feeds_rx.recv() => ctx.feeds.extend(handles),
            Some(event) = events_rx.recv() => {
                if let UiEvent::DeviceFound { address, .. } = &event {
                    ctx.on_device_found(*address, feeds_tx.clone());
                }
                print_event(&event);
            }
        }
    }

    if ctx.session.is_active() {
        if let Err(e) = ctx.session.stop() {
            warn!("Failed to stop recording: {}", e);
        }
    }

    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sublink=info".parse().unwrap())
                .add_directive("sublink_operator=info".parse().unwrap()),
        )
        .init();
}
