//! Notifications from the backbone to the UI collaborator
//!
//! Every producer (discovery listener, liveness ticker, telemetry path, feed
//! consumers, recording session) holds a clone of the sender. Exactly one
//! loop owns the receiver and applies the events.

use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::detection::DetectionResult;
use crate::telemetry::TelemetryRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    /// An address was named by an identity reply for the first time
    DeviceFound { name: String, address: IpAddr },
    LivenessChanged {
        name: String,
        address: IpAddr,
        alive: bool,
    },
    Telemetry {
        address: IpAddr,
        record: TelemetryRecord,
    },
    /// Free-text log line from a device
    Message { address: IpAddr, text: String },
    RecordingChanged {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_path: Option<PathBuf>,
    },
    Detection {
        camera: usize,
        result: DetectionResult,
    },
    /// A feed consumer connected to or lost its stream
    FeedChanged { camera: usize, connected: bool },
}

pub type UiEventSender = mpsc::UnboundedSender<UiEvent>;
pub type UiEventReceiver = mpsc::UnboundedReceiver<UiEvent>;

/// Create the UI event channel. Sends never block.
pub fn ui_channel() -> (UiEventSender, UiEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_tag() {
        let event = UiEvent::DeviceFound {
            name: "RPi".into(),
            address: IpAddr::from([192, 168, 1, 50]),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "device_found");
        assert_eq!(json["address"], "192.168.1.50");
    }

    #[test]
    fn test_recording_event_omits_missing_path() {
        let event = UiEvent::RecordingChanged {
            active: false,
            log_path: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"recording_changed","active":false}"#);
    }

    #[tokio::test]
    async fn test_send_never_blocks() {
        let (tx, mut rx) = ui_channel();
        for camera in 0..1000 {
            tx.send(UiEvent::FeedChanged {
                camera,
                connected: true,
            })
            .unwrap();
        }
        drop(tx);
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1000);
    }
}
