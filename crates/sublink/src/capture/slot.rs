//! Per-camera shared state: the latest-frame cache and the published status

use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use super::Backend;

/// Lifecycle of one camera slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Opening,
    /// Reads succeed; the only state that updates the cache
    Capturing,
    /// Reads failing; the last good frame keeps being served
    Degraded,
    Reopening,
    /// Reopen failed; waits out the backoff before the next attempt
    Failed,
}

impl CameraState {
    /// Whether a device is currently open
    pub fn is_active(self) -> bool {
        matches!(self, CameraState::Capturing | CameraState::Degraded)
    }
}

/// Latest encoded frame of a camera.
///
/// The lock only guards a `Bytes` swap or clone; no I/O happens under it.
#[derive(Debug, Clone, Default)]
pub struct FrameCache {
    inner: Arc<Mutex<Option<Bytes>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Bytes) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_frame(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Snapshot published by the capture loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub state: CameraState,
    pub consecutive_failures: u32,
    pub backend: Option<Backend>,
}

impl Default for SlotStatus {
    fn default() -> Self {
        Self {
            state: CameraState::Opening,
            consecutive_failures: 0,
            backend: None,
        }
    }
}

/// Read side of one camera, handed to the streaming server
#[derive(Debug, Clone)]
pub struct CameraSlot {
    pub index: u32,
    pub cache: FrameCache,
    pub status: watch::Receiver<SlotStatus>,
}

impl CameraSlot {
    pub fn state(&self) -> CameraState {
        self.status.borrow().state
    }
}
