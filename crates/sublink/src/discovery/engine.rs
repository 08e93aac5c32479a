//! Operator-side discovery engine
//!
//! One UDP socket carries the broadcast query, the identity replies and the
//! telemetry stream. Every valid packet refreshes the sender's liveness.
//! Telemetry is handed off with `try_send` so a slow consumer drops packets
//! instead of stalling the listener.

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DiscoveryConfig;
use crate::registry::{LivenessChange, PeerRecord, PeerRegistry, Touch};
use crate::telemetry::{InboundTelemetry, TelemetryRecord};
use crate::{Packet, UiEvent, UiEventSender, DISCOVERY_QUERY, MAX_DATAGRAM_SIZE};

/// Capacity of the telemetry hand-off queue
pub const TELEMETRY_QUEUE_DEPTH: usize = 64;

/// Handle to the discovery engine (cheap to clone)
#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    socket: UdpSocket,
    config: DiscoveryConfig,
    registry: Mutex<PeerRegistry>,
    events: UiEventSender,
    telemetry_tx: mpsc::Sender<InboundTelemetry>,
}

impl DiscoveryEngine {
    /// Bind the operator socket and create the telemetry queue.
    pub async fn bind(
        config: DiscoveryConfig,
        events: UiEventSender,
    ) -> Result<(Self, mpsc::Receiver<InboundTelemetry>)> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
            .await
            .with_context(|| format!("Failed to bind discovery socket on port {}", config.listen_port))?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on discovery socket")?;

        let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE_DEPTH);
        let registry = PeerRegistry::new(config.liveness_timeout);

        let engine = Self {
            inner: Arc::new(EngineInner {
                socket,
                config,
                registry: Mutex::new(registry),
                events,
                telemetry_tx,
            }),
        };
        Ok((engine, telemetry_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .socket
            .local_addr()
            .context("Discovery socket has no local address")
    }

    /// Send the query to the broadcast address. Replies arrive on the listener.
    pub async fn broadcast_discovery(&self) -> Result<()> {
        let target = self.inner.config.broadcast_target();
        self.inner
            .socket
            .send_to(DISCOVERY_QUERY.as_bytes(), target)
            .await
            .with_context(|| format!("Failed to broadcast discovery to {}", target))?;
        debug!(%target, "Sent discovery query");
        Ok(())
    }

    /// Classify one datagram and apply it to the registry.
    pub async fn on_packet(&self, bytes: &[u8], from: SocketAddr, now: Instant) {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!(%from, "Dropping non-UTF-8 datagram");
                return;
            }
        };
        let address = from.ip();

        match Packet::classify(text) {
            Packet::Identity(name) => self.on_identity(address, name, now).await,
            Packet::Telemetry(text) => {
                self.refresh(address, now).await;
                let inbound = InboundTelemetry {
                    from: address,
                    record: TelemetryRecord::parse(text),
                };
                if let Err(e) = self.inner.telemetry_tx.try_send(inbound) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            debug!(%address, "Telemetry queue full, dropping packet")
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            debug!(%address, "Telemetry receiver dropped")
                        }
                    }
                }
            }
            Packet::Message(body) => {
                self.refresh(address, now).await;
                let _ = self.inner.events.send(UiEvent::Message {
                    address,
                    text: body.to_string(),
                });
            }
            Packet::Query | Packet::Unknown => {}
        }
    }

    async fn on_identity(&self, address: IpAddr, name: &str, now: Instant) {
        let (touch, renamed) = {
            let mut registry = self.inner.registry.lock().await;
            let renamed = registry.get(&address).map_or(true, |p| p.name != name);
            let touch = registry.record_identity(address, name, now);
            (touch, renamed)
        };

        if renamed {
            info!(device = %name, %address, "Device found");
            let _ = self.inner.events.send(UiEvent::DeviceFound {
                name: name.to_string(),
                address,
            });
        }
        if touch == Touch::Revived {
            self.announce_revival(address, name);
        }
    }

    async fn refresh(&self, address: IpAddr, now: Instant) {
        let revived = {
            let mut registry = self.inner.registry.lock().await;
            match registry.touch(address, now) {
                Touch::Revived => registry.get(&address).map(|p| p.name.clone()),
                Touch::New | Touch::Refreshed => None,
            }
        };
        if let Some(name) = revived {
            self.announce_revival(address, &name);
        }
    }

    fn announce_revival(&self, address: IpAddr, name: &str) {
        info!(device = %name, %address, "Device alive again");
        let _ = self.inner.events.send(UiEvent::LivenessChanged {
            name: name.to_string(),
            address,
            alive: true,
        });
    }

    /// Mark stale peers dead and emit one notification per transition.
    pub async fn check_liveness(&self, now: Instant) -> Vec<LivenessChange> {
        let changes = self.inner.registry.lock().await.check_liveness(now);
        for change in &changes {
            warn!(device = %change.name, address = %change.address, "Device timed out");
            let _ = self.inner.events.send(UiEvent::LivenessChanged {
                name: change.name.clone(),
                address: change.address,
                alive: change.alive,
            });
        }
        changes
    }

    /// Snapshot of all known peers
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.registry.lock().await.peers()
    }

    /// Receive loop for replies, telemetry and messages
    pub async fn run_listener(&self, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let recv_timeout = self.inner.config.recv_timeout;
        info!(addr = ?self.inner.socket.local_addr().ok(), "Discovery listener started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(recv_timeout, self.inner.socket.recv_from(&mut buf)) => r,
            };

            match received {
                Err(_) => continue,
                Ok(Err(e)) => debug!("Discovery receive error: {}", e),
                Ok(Ok((len, from))) => self.on_packet(&buf[..len], from, Instant::now()).await,
            }
        }

        debug!("Discovery listener stopped");
    }

    /// Periodic liveness evaluation
    pub async fn run_liveness(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.liveness_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_liveness(Instant::now()).await;
                }
            }
        }
        debug!("Liveness checker stopped");
    }
}
