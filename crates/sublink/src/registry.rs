//! Liveness registry: known peers and when they were last heard from
//!
//! Pure data plus timeout evaluation. Callers pass `now` explicitly, so the
//! registry never reads a clock and never performs I/O. Records are keyed
//! by IP address and are never evicted; a silent peer is only marked dead.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A peer known to the operator station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Device name from the identity reply (the address text until named)
    pub name: String,
    /// Unique key
    pub address: IpAddr,
    /// Time of the most recent packet of any kind
    pub last_seen_at: Instant,
    pub alive: bool,
}

/// What a packet did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Touch {
    /// First packet from this address
    New,
    /// The peer was marked dead and is alive again
    Revived,
    /// Known live peer, timestamp refreshed
    Refreshed,
}

/// An alive/dead transition produced by a liveness check or a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    pub address: IpAddr,
    pub name: String,
    pub alive: bool,
}

/// In-memory peer table
#[derive(Debug)]
pub struct PeerRegistry {
    peers: BTreeMap<IpAddr, PeerRecord>,
    timeout: Duration,
}

impl PeerRegistry {
    /// Create an empty registry with the given liveness timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: BTreeMap::new(),
            timeout,
        }
    }

    /// Record an identity reply: upsert the peer, set its name, mark it alive.
    pub fn record_identity(&mut self, address: IpAddr, name: &str, now: Instant) -> Touch {
        let touch = self.touch(address, now);
        if let Some(peer) = self.peers.get_mut(&address) {
            if peer.name != name {
                peer.name = name.to_string();
            }
        }
        touch
    }

    /// Refresh `last_seen_at` for any valid packet from `address`.
    ///
    /// An unseen address is created under its own address text. A dead peer
    /// flips back to alive immediately.
    pub fn touch(&mut self, address: IpAddr, now: Instant) -> Touch {
        match self.peers.get_mut(&address) {
            Some(peer) => {
                peer.last_seen_at = now;
                if peer.alive {
                    Touch::Refreshed
                } else {
                    peer.alive = true;
                    Touch::Revived
                }
            }
            None => {
                self.peers.insert(
                    address,
                    PeerRecord {
                        name: address.to_string(),
                        address,
                        last_seen_at: now,
                        alive: true,
                    },
                );
                Touch::New
            }
        }
    }

    /// Mark every live peer silent for longer than the timeout as dead.
    ///
    /// Each stale peer is reported exactly once; already-dead peers are
    /// skipped until a packet revives them.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<LivenessChange> {
        let timeout = self.timeout;
        self.peers
            .values_mut()
            .filter(|peer| peer.alive && now.saturating_duration_since(peer.last_seen_at) > timeout)
            .map(|peer| {
                peer.alive = false;
                LivenessChange {
                    address: peer.address,
                    name: peer.name.clone(),
                    alive: false,
                }
            })
            .collect()
    }

    pub fn get(&self, address: &IpAddr) -> Option<&PeerRecord> {
        self.peers.get(address)
    }

    /// Snapshot of all peers, ordered by address
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(10))
    }

    #[test]
    fn identity_creates_alive_named_peer() {
        let mut reg = registry();
        let now = Instant::now();

        assert_eq!(reg.record_identity(addr(50), "RPi", now), Touch::New);

        let peer = reg.get(&addr(50)).unwrap();
        assert_eq!(peer.name, "RPi");
        assert_eq!(peer.address.to_string(), "192.168.1.50");
        assert!(peer.alive);
    }

    #[test]
    fn telemetry_first_contact_uses_address_as_name() {
        let mut reg = registry();
        assert_eq!(reg.touch(addr(7), Instant::now()), Touch::New);
        assert_eq!(reg.get(&addr(7)).unwrap().name, "192.168.1.7");
    }

    #[test]
    fn identity_renames_telemetry_only_peer() {
        let mut reg = registry();
        let now = Instant::now();
        reg.touch(addr(7), now);
        assert_eq!(reg.record_identity(addr(7), "RPi", now), Touch::Refreshed);
        assert_eq!(reg.get(&addr(7)).unwrap().name, "RPi");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stale_peer_dies_exactly_once() {
        let mut reg = registry();
        let start = Instant::now();
        reg.record_identity(addr(50), "RPi", start);

        // At exactly the timeout the peer is still alive
        assert!(reg.check_liveness(start + Duration::from_secs(10)).is_empty());

        let changes = reg.check_liveness(start + Duration::from_secs(11));
        assert_eq!(
            changes,
            vec![LivenessChange {
                address: addr(50),
                name: "RPi".into(),
                alive: false
            }]
        );

        // Later checks in the same stale interval report nothing
        assert!(reg.check_liveness(start + Duration::from_secs(13)).is_empty());
        assert!(reg.check_liveness(start + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn dead_peer_revives_on_next_packet() {
        let mut reg = registry();
        let start = Instant::now();
        reg.record_identity(addr(50), "RPi", start);
        reg.check_liveness(start + Duration::from_secs(11));
        assert!(!reg.get(&addr(50)).unwrap().alive);

        // Any packet type revives: here a plain touch (telemetry)
        assert_eq!(reg.touch(addr(50), start + Duration::from_secs(12)), Touch::Revived);
        assert!(reg.get(&addr(50)).unwrap().alive);

        // And it can go stale again in a new window
        let changes = reg.check_liveness(start + Duration::from_secs(23));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn dead_peers_are_never_evicted() {
        let mut reg = registry();
        let start = Instant::now();
        reg.record_identity(addr(1), "a", start);
        reg.record_identity(addr(2), "b", start);
        reg.check_liveness(start + Duration::from_secs(3600));

        assert_eq!(reg.len(), 2);
        assert!(reg.peers().iter().all(|p| !p.alive));
    }

    #[test]
    fn only_stale_peers_transition() {
        let mut reg = registry();
        let start = Instant::now();
        reg.record_identity(addr(1), "old", start);
        reg.record_identity(addr(2), "fresh", start + Duration::from_secs(8));

        let changes = reg.check_liveness(start + Duration::from_secs(12));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "old");
        assert!(reg.get(&addr(2)).unwrap().alive);
    }
}
