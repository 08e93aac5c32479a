//! Wire constants and packet classification for the UDP discovery protocol
//!
//! Every datagram is plain ASCII text. The operator broadcasts a fixed
//! query, edge nodes answer with their identity, and telemetry or log
//! messages are recognised by their leading keyword.

use std::net::Ipv4Addr;
use std::time::Duration;

/// UDP port for discovery queries, replies and telemetry
pub const DISCOVERY_PORT: u16 = 5005;

/// HTTP port the edge node serves camera streams on
pub const STREAM_PORT: u16 = 5000;

/// Query broadcast by the operator station
pub const DISCOVERY_QUERY: &str = "Who are you?";

/// Prefix of an identity reply, followed by the device name
pub const IDENTITY_PREFIX: &str = "I am ";

/// Prefix of a telemetry packet
pub const TELEMETRY_PREFIX: &str = "data";

/// Prefix of a free-text log message
pub const MESSAGE_PREFIX: &str = "message";

/// Multipart boundary of the MJPEG streams
pub const MJPEG_BOUNDARY: &str = "frame";

/// Interval between parts of an MJPEG stream (~30 fps)
pub const STREAM_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Default subnet broadcast address for discovery
pub const DEFAULT_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 255);

/// A peer with no packets for longer than this is considered dead
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the operator evaluates peer liveness
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Bounded receive wait so listeners can observe shutdown between packets
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive buffer size for a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// A decoded discovery-port datagram, classified by its leading text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// The operator's discovery query
    Query,
    /// Identity reply carrying the device name
    Identity(&'a str),
    /// Telemetry packet; carries the full text including the header line
    Telemetry(&'a str),
    /// Free-text log message with the prefix stripped
    Message(&'a str),
    /// Unrecognised prefix, dropped for forward compatibility
    Unknown,
}

impl<'a> Packet<'a> {
    /// Classify a datagram by prefix.
    pub fn classify(text: &'a str) -> Self {
        if text == DISCOVERY_QUERY {
            return Packet::Query;
        }
        if let Some(name) = text.strip_prefix(IDENTITY_PREFIX) {
            let name = name.trim();
            return if name.is_empty() {
                Packet::Unknown
            } else {
                Packet::Identity(name)
            };
        }
        if text.starts_with(TELEMETRY_PREFIX) {
            return Packet::Telemetry(text);
        }
        if let Some(body) = text.strip_prefix(MESSAGE_PREFIX) {
            let body = body.trim_start_matches([':', ' ', '\t', '\r', '\n']);
            return Packet::Message(body.trim_end());
        }
        Packet::Unknown
    }
}

/// Build the identity reply for a device name.
pub fn identity_reply(device_name: &str) -> String {
    format!("{}{}", IDENTITY_PREFIX, device_name)
}

/// URL path of the stream for a 1-based feed number.
pub fn video_feed_path(feed: usize) -> String {
    format!("/video_feed_{}", feed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_query_exactly() {
        assert_eq!(Packet::classify("Who are you?"), Packet::Query);
        // Near misses are not queries
        assert_eq!(Packet::classify("Who are you? "), Packet::Unknown);
        assert_eq!(Packet::classify("who are you?"), Packet::Unknown);
    }

    #[test]
    fn classifies_identity_reply() {
        assert_eq!(Packet::classify("I am RPi"), Packet::Identity("RPi"));
        assert_eq!(
            Packet::classify(&identity_reply("rov-front")),
            Packet::Identity("rov-front")
        );
    }

    #[test]
    fn identity_needs_separator_and_name() {
        assert_eq!(Packet::classify("I amX"), Packet::Unknown);
        assert_eq!(Packet::classify("I am "), Packet::Unknown);
        assert_eq!(Packet::classify("I am   "), Packet::Unknown);
        assert_eq!(Packet::classify("I am  RPi "), Packet::Identity("RPi"));
        assert_eq!(identity_reply("RPi"), "I am RPi");
    }

    #[test]
    fn classifies_telemetry_with_full_text() {
        let text = "data\ndepth: 3.2\n";
        assert_eq!(Packet::classify(text), Packet::Telemetry(text));
    }

    #[test]
    fn classifies_message_and_strips_separator() {
        assert_eq!(
            Packet::classify("message: leak sensor dry"),
            Packet::Message("leak sensor dry")
        );
        assert_eq!(Packet::classify("message\nboot ok\n"), Packet::Message("boot ok"));
    }

    #[test]
    fn unknown_prefix_is_ignored() {
        assert_eq!(Packet::classify("ping"), Packet::Unknown);
        assert_eq!(Packet::classify(""), Packet::Unknown);
    }

    #[test]
    fn feed_path_is_one_based_name() {
        assert_eq!(video_feed_path(1), "/video_feed_1");
    }
}
