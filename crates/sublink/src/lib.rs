//! Sublink - communication backbone for a tethered underwater vehicle
//!
//! The edge node (on the vehicle) captures cameras, serves them as MJPEG
//! streams and answers discovery queries. The operator station broadcasts
//! for devices, tracks their liveness, ingests telemetry and records
//! sessions. Feature flags control which halves are compiled:
//!
//! - **Core** (always available): protocol constants, peer registry,
//!   telemetry parsing, discovery, recording session, UI events and commands
//! - **`capture`**: supervised camera capture with automatic reopen
//! - **`v4l2`**: direct V4L2 capture backend (implies `capture`)
//! - **`test-source`**: synthetic camera without hardware (implies `capture`)
//! - **`web`**: axum MJPEG streaming server (implies `capture`)
//! - **`feed`**: operator-side MJPEG feed consumers

// Core modules (always compiled)
mod command;
mod events;
mod protocol;

pub mod detection;
pub mod discovery;
pub mod recording;
pub mod registry;
pub mod telemetry;

pub use command::{OperatorCommand, ParseCommandError};
pub use events::{ui_channel, UiEvent, UiEventReceiver, UiEventSender};
pub use protocol::*;

// Capture: per-camera supervised capture loops and frame caches
#[cfg(feature = "capture")]
pub mod capture;

// Web: axum server for /video_feed_<n> and /status
#[cfg(feature = "web")]
pub mod web;

// Feed: operator-side consumers of the edge MJPEG streams
#[cfg(feature = "feed")]
pub mod feed;
