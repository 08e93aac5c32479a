//! Edge-side discovery responder

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{identity_reply, Packet, MAX_DATAGRAM_SIZE};

/// Answers `"Who are you?"` with `"I am <name>"`. Keeps no registry; it only
/// remembers the most recent querier so telemetry knows where to go.
pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    device_name: String,
    recv_timeout: Duration,
    operator_tx: watch::Sender<Option<SocketAddr>>,
}

impl DiscoveryResponder {
    /// Bind the responder on all interfaces at `port`.
    pub async fn bind(port: u16, device_name: impl Into<String>, recv_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("Failed to bind discovery responder on port {}", port))?;
        Ok(Self::from_socket(Arc::new(socket), device_name, recv_timeout))
    }

    pub fn from_socket(socket: Arc<UdpSocket>, device_name: impl Into<String>, recv_timeout: Duration) -> Self {
        let (operator_tx, _) = watch::channel(None);
        Self {
            socket,
            device_name: device_name.into(),
            recv_timeout,
            operator_tx,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Responder socket has no local address")
    }

    /// The socket, shared with the telemetry reporter
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Address of the operator that last queried this node
    pub fn operator(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.operator_tx.subscribe()
    }

    /// Decide the reply to a datagram. Only the exact query gets one.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<String> {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!(%from, "Dropping non-UTF-8 datagram");
                return None;
            }
        };

        match Packet::classify(text) {
            Packet::Query => {
                self.operator_tx.send_if_modified(|current| {
                    if *current == Some(from) {
                        false
                    } else {
                        info!(operator = %from, "Operator station found");
                        *current = Some(from);
                        true
                    }
                });
                Some(identity_reply(&self.device_name))
            }
            _ => None,
        }
    }

    /// Receive loop. Each receive waits at most `recv_timeout` so the loop
    /// notices cancellation between packets.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        info!(
            addr = ?self.socket.local_addr().ok(),
            device = %self.device_name,
            "Discovery responder listening"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)) => r,
            };

            let (len, from) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    debug!("Discovery receive error: {}", e);
                    continue;
                }
                Ok(Ok(r)) => r,
            };

            if let Some(reply) = self.handle_datagram(&buf[..len], from) {
                if let Err(e) = self.socket.send_to(reply.as_bytes(), from).await {
                    warn!(%from, "Failed to send identity reply: {}", e);
                }
            }
        }

        debug!("Discovery responder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn responder(name: &str) -> DiscoveryResponder {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        DiscoveryResponder::from_socket(Arc::new(socket), name, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_replies_only_to_exact_query() {
        let r = responder("RPi").await;
        let from: SocketAddr = "192.168.1.10:40000".parse().unwrap();

        assert_eq!(r.handle_datagram(b"Who are you?", from).as_deref(), Some("I am RPi"));
        assert_eq!(r.handle_datagram(b"I am other", from), None);
        assert_eq!(r.handle_datagram(b"data\nx: 1", from), None);
        assert_eq!(r.handle_datagram(&[0xff, 0xfe], from), None);
    }

    #[tokio::test]
    async fn test_remembers_last_querier() {
        let r = responder("RPi").await;
        let rx = r.operator();
        assert_eq!(*rx.borrow(), None);

        let first: SocketAddr = "192.168.1.10:40000".parse().unwrap();
        let second: SocketAddr = "192.168.1.11:40001".parse().unwrap();
        r.handle_datagram(b"Who are you?", first);
        assert_eq!(*rx.borrow(), Some(first));
        r.handle_datagram(b"Who are you?", second);
        assert_eq!(*rx.borrow(), Some(second));
    }

    #[tokio::test]
    async fn test_run_answers_over_udp_and_stops_on_cancel() {
        let r = Arc::new(responder("rov").await);
        let addr = r.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = {
            let r = r.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { r.run(cancel).await })
        };

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"Who are you?", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"I am rov");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("responder should stop")
            .unwrap();
    }
}
