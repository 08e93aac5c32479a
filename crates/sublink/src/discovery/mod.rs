//! Discovery and liveness protocol over UDP
//!
//! - [`DiscoveryResponder`]: edge side, answers the discovery query with the
//!   device name and remembers which operator asked
//! - [`DiscoveryEngine`]: operator side, broadcasts the query, classifies
//!   every inbound datagram and drives the [`PeerRegistry`](crate::registry::PeerRegistry)

mod engine;
mod responder;

pub use engine::{DiscoveryEngine, TELEMETRY_QUEUE_DEPTH};
pub use responder::DiscoveryResponder;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::{
    DEFAULT_BROADCAST_ADDR, DISCOVERY_PORT, LIVENESS_CHECK_INTERVAL, LIVENESS_TIMEOUT,
    RECV_TIMEOUT,
};

/// Intervals and addresses for both sides of discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port edge nodes listen on and queries are sent to
    pub port: u16,
    /// Where the operator sends the discovery query
    pub broadcast_addr: IpAddr,
    /// Local port of the operator socket (0 = ephemeral)
    pub listen_port: u16,
    pub liveness_timeout: Duration,
    pub liveness_interval: Duration,
    /// Upper bound on a single receive so loops can observe shutdown
    pub recv_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(DEFAULT_BROADCAST_ADDR),
            listen_port: 0,
            liveness_timeout: LIVENESS_TIMEOUT,
            liveness_interval: LIVENESS_CHECK_INTERVAL,
            recv_timeout: RECV_TIMEOUT,
        }
    }
}

impl DiscoveryConfig {
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.port)
    }
}
