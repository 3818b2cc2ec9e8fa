//! smokewatch - multi-camera smoke detection
//!
//! This crate implements the detection pipeline behind `smokewatchd`.
//!
//! # Architecture
//!
//! Every enabled camera gets its own worker thread:
//!
//! 1. **Ingest**: a `FrameSource` yields decoded raster frames with a bounded wait.
//! 2. **Normalize**: frames are converted to single-channel intensity and resized.
//! 3. **Buffer**: a bounded `FrameBuffer` keeps recent frames plus a baseline frame.
//! 4. **Detect**: `SmokeDetector` tiles current and baseline into patches, compares
//!    their intensity distributions (Wasserstein-1 and mean difference) and runs a
//!    debounced IDLE/ALERT state machine.
//! 5. **Record**: state transitions and camera status changes land in the `EventLog`.
//!
//! Readers (dashboards, APIs) consume status, artifacts and events through
//! snapshot handles that never block the producing worker for longer than a
//! pointer swap.
//!
//! # Module Structure
//!
//! - `frame`: `RawFrame`, `GrayFrame`, `FrameBuffer`
//! - `ingest`: frame sources (synthetic `stub://`, RTSP) and normalization
//! - `detect`: patch statistics, distance metrics, detector, artifacts
//! - `events`: event records, queries, storage backends
//! - `worker` / `supervisor`: per-camera loops and their lifecycle
//! - `config`: configuration loading and hot-reloadable settings

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod schedule;
pub mod snapshot;
pub mod supervisor;
pub mod worker;

pub use config::{CameraConfig, DetectionSettings, SettingsHandle, SmokewatchConfig};
pub use detect::{
    trigger_threshold, ArtifactBoard, ArtifactKind, ArtifactSet, DetectionResult, DetectorPhase,
    DetectorState, PatchCoord, PatchGrid, PatchStatistics, SmokeDetector, Transition,
};
pub use events::{
    EventGrouping, EventKind, EventLog, EventQuery, EventRecord, EventStore, InMemoryEventStore,
    SqliteEventStore,
};
pub use frame::{FrameBuffer, GrayFrame, PixelFormat, RawFrame, MAX_HISTORY_FRAMES};
pub use ingest::{FrameSource, SourceError, SourceFactory, SyntheticSource};
pub use supervisor::{ReconcileReport, Supervisor, WorkerHandle};
pub use worker::{CameraState, CameraStatus, CameraWorker, IterationOutcome};

/// Upper bound on concurrently running camera workers.
pub const MAX_CAMERAS: usize = 16;

/// A conforming camera id is a short local identifier.
///
/// Allowed: "cam-1", "loading_bay", "North2"
/// Disallowed: empty ids, whitespace, slashes, anything longer than 64 characters.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id '{}' must match ^[A-Za-z0-9_-]{{1,64}}$",
            camera_id
        ));
    }
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_ids_follow_allowlist() {
        assert!(validate_camera_id("cam-1").is_ok());
        assert!(validate_camera_id("loading_bay").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("cam 1").is_err());
        assert!(validate_camera_id("cam/1").is_err());
        assert!(validate_camera_id(&"x".repeat(65)).is_err());
    }
}
