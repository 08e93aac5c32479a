//! Camera enumeration and one capture loop per slot

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::{CameraSlot, CaptureConfig, CaptureSupervisor, DeviceOpener};

/// Indices below `max_probe` with an openable capture node.
///
/// USB cameras register a second metadata node; only the primary node of
/// each device (sysfs `index` 0) counts when sysfs is available.
pub fn discover_indices(max_probe: u32) -> Vec<u32> {
    discover_in(Path::new("/dev"), Path::new("/sys/class/video4linux"), max_probe)
}

fn discover_in(dev: &Path, sysfs: &Path, max_probe: u32) -> Vec<u32> {
    (0..max_probe)
        .filter(|i| dev.join(format!("video{}", i)).exists())
        .filter(|i| {
            match fs::read_to_string(sysfs.join(format!("video{}", i)).join("index")) {
                Ok(index) => index.trim() == "0",
                Err(_) => true,
            }
        })
        .collect()
}

/// Owns nothing but the slots; capture loops run on the blocking pool.
pub struct CameraManager {
    slots: Vec<CameraSlot>,
}

impl CameraManager {
    /// Spawn a supervised capture loop for each index.
    pub fn start(
        indices: &[u32],
        config: &CaptureConfig,
        opener: Arc<dyn DeviceOpener>,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Self {
        let mut slots = Vec::with_capacity(indices.len());
        for &index in indices {
            let (supervisor, slot) = CaptureSupervisor::new(index, config.clone(), opener.clone());
            let cancel = cancel.clone();
            tracker.spawn_blocking(move || supervisor.run(cancel));
            debug!(camera = index, "Spawned capture loop");
            slots.push(slot);
        }
        info!(cameras = ?indices, "Camera manager started");
        Self { slots }
    }

    /// Slots in discovery order; feed `n` is `slots()[n - 1]`
    pub fn slots(&self) -> &[CameraSlot] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<CameraSlot> {
        self.slots
    }
}
