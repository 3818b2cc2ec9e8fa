use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{
    trigger_threshold, validate_bins, MAX_SENSITIVITY, MIN_ENTRY_FRAMES, MIN_SENSITIVITY,
};
use crate::frame::MAX_HISTORY_FRAMES;
use crate::schedule::DetectionSchedule;

const DEFAULT_SLIDING_WINDOW: u32 = 16;
const DEFAULT_SENSITIVITY: u32 = 5;
const DEFAULT_MOTION_THRESHOLD: f32 = 60.0;
const DEFAULT_SLEEP_TIME_SECS: f64 = 1.0;
const DEFAULT_HISTOGRAM_BINS: usize = 32;
const DEFAULT_ENTRY_FRAMES: u32 = 2;
const DEFAULT_EXIT_FRAMES: u32 = 5;
const DEFAULT_BASELINE_REFRESH_FRAMES: u64 = 50;
const DEFAULT_HISTORY_FRAMES: usize = 11;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SCHEDULE_START: &str = "22:00";
const DEFAULT_SCHEDULE_END: &str = "06:00";

const DEFAULT_CAMERA_PORT: u16 = 554;
const DEFAULT_CAMERA_USERNAME: &str = "admin";
const DEFAULT_STREAM_PATH: &str = "/cam/realmonitor?channel=1&subtype=1";
const DEFAULT_TARGET_FPS: f64 = 3.0;
const DEFAULT_FRAME_WIDTH: u32 = 896;
const DEFAULT_FRAME_HEIGHT: u32 = 504;

// -------------------- file model --------------------

#[derive(Debug, Deserialize, Default)]
struct SmokewatchConfigFile {
    detection: Option<DetectionConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    events: Option<EventsConfigFile>,
    snapshots: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    sliding_window: Option<u32>,
    sensitivity: Option<u32>,
    motion_threshold: Option<f32>,
    sleep_time: Option<f64>,
    histogram_bins: Option<usize>,
    entry_frames: Option<u32>,
    exit_frames: Option<u32>,
    baseline_refresh_frames: Option<u64>,
    history_frames: Option<usize>,
    motion_count_threshold: Option<u64>,
    frame_timeout_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    detection_enabled: Option<bool>,
    schedule: Option<ScheduleConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ScheduleConfigFile {
    enabled: Option<bool>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    stream_path: Option<String>,
    target_fps: Option<f64>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    dir: Option<PathBuf>,
}

// -------------------- resolved settings --------------------

/// Global detection settings. Hot-reloadable through `SettingsHandle`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    /// Patch edge length in pixels.
    pub sliding_window: u32,
    /// 1..=10, higher triggers on fewer active patches.
    pub sensitivity: u32,
    /// Distance (intensity units) at which a patch counts as active.
    pub motion_threshold: f32,
    /// Seconds between iterations for cameras with `target_fps = 0`.
    pub sleep_time: f64,
    pub histogram_bins: usize,
    pub entry_frames: u32,
    pub exit_frames: u32,
    /// Accepted frames between baseline refreshes, 0 disables refresh.
    pub baseline_refresh_frames: u64,
    /// Frame history per camera. Applied when a worker starts.
    pub history_frames: usize,
    /// Changed-pixel count above which a frame is a global disturbance, 0 disables.
    pub motion_count_threshold: u64,
    pub frame_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub detection_enabled: bool,
    pub schedule: DetectionSchedule,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            sliding_window: DEFAULT_SLIDING_WINDOW,
            sensitivity: DEFAULT_SENSITIVITY,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            sleep_time: DEFAULT_SLEEP_TIME_SECS,
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
            entry_frames: DEFAULT_ENTRY_FRAMES,
            exit_frames: DEFAULT_EXIT_FRAMES,
            baseline_refresh_frames: DEFAULT_BASELINE_REFRESH_FRAMES,
            history_frames: DEFAULT_HISTORY_FRAMES,
            motion_count_threshold: 0,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            detection_enabled: true,
            schedule: DetectionSchedule::default(),
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.sliding_window == 0 {
            return Err(anyhow!("sliding_window must be greater than zero"));
        }
        if !(MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&self.sensitivity) {
            return Err(anyhow!(
                "sensitivity must be within {}..={}, got {}",
                MIN_SENSITIVITY,
                MAX_SENSITIVITY,
                self.sensitivity
            ));
        }
        if !self.motion_threshold.is_finite() || self.motion_threshold <= 0.0 {
            return Err(anyhow!("motion_threshold must be a positive number"));
        }
        if !self.sleep_time.is_finite() || self.sleep_time <= 0.0 {
            return Err(anyhow!("sleep_time must be a positive number of seconds"));
        }
        validate_bins(self.histogram_bins)?;
        if self.entry_frames < MIN_ENTRY_FRAMES {
            return Err(anyhow!(
                "entry_frames must be at least {}",
                MIN_ENTRY_FRAMES
            ));
        }
        if self.exit_frames < self.entry_frames {
            return Err(anyhow!(
                "exit_frames ({}) must not be shorter than entry_frames ({})",
                self.exit_frames,
                self.entry_frames
            ));
        }
        if self.history_frames == 0 || self.history_frames > MAX_HISTORY_FRAMES {
            return Err(anyhow!(
                "history_frames must be within 1..={}",
                MAX_HISTORY_FRAMES
            ));
        }
        if self.frame_timeout_ms == 0 {
            return Err(anyhow!("frame_timeout_ms must be greater than zero"));
        }
        if self.backoff_initial_ms == 0 || self.backoff_max_ms < self.backoff_initial_ms {
            return Err(anyhow!(
                "backoff must satisfy 0 < backoff_initial_ms <= backoff_max_ms"
            ));
        }
        Ok(())
    }

    pub fn trigger_threshold(&self) -> u32 {
        trigger_threshold(self.sensitivity)
    }

    pub fn effective_entry_frames(&self) -> u32 {
        self.entry_frames.max(MIN_ENTRY_FRAMES)
    }

    pub fn effective_exit_frames(&self) -> u32 {
        self.exit_frames.max(self.effective_entry_frames())
    }

    /// Loop period for a camera running at `target_fps`.
    pub fn frame_interval(&self, target_fps: f64) -> Duration {
        if target_fps > 0.0 && target_fps.is_finite() {
            Duration::from_secs_f64(1.0 / target_fps)
        } else {
            Duration::from_secs_f64(self.sleep_time.max(0.0))
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Shared, atomically swappable settings snapshot.
///
/// Workers call `load()` once per iteration; `update` validates and swaps.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<DetectionSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: DetectionSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn load(&self) -> Arc<DetectionSettings> {
        self.inner.load_full()
    }

    pub fn update(&self, settings: DetectionSettings) -> Result<()> {
        settings.validate()?;
        self.inner.store(Arc::new(settings));
        Ok(())
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(DetectionSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    /// Stream URL, may carry credentials. Use `redact_credentials` before logging.
    pub url: String,
    /// 0 means pace at the global `sleep_time`.
    pub target_fps: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub enabled: bool,
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            target_fps: DEFAULT_TARGET_FPS,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            enabled: true,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.frame_width = width;
        self.frame_height = height;
        self
    }

    pub fn with_target_fps(mut self, target_fps: f64) -> Self {
        self.target_fps = target_fps;
        self
    }

    pub fn source_url(&self) -> String {
        self.url.clone()
    }

    pub fn validate(&self, settings: &DetectionSettings) -> Result<()> {
        crate::validate_camera_id(&self.id)?;
        if self.url.trim().is_empty() {
            return Err(anyhow!("camera {} has no source URL", self.id));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(anyhow!(
                "camera {} frame dimensions must be positive",
                self.id
            ));
        }
        if !self.target_fps.is_finite() || self.target_fps < 0.0 {
            return Err(anyhow!(
                "camera {} target_fps must be a non-negative number",
                self.id
            ));
        }
        if settings.sliding_window > self.frame_width.min(self.frame_height) {
            return Err(anyhow!(
                "camera {}: sliding_window {} exceeds frame {}x{}",
                self.id,
                settings.sliding_window,
                self.frame_width,
                self.frame_height
            ));
        }
        Ok(())
    }
}

/// A camera entry that failed validation. Other cameras still start.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraRejection {
    pub camera_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SmokewatchConfig {
    pub detection: DetectionSettings,
    /// Accepted cameras, enabled and disabled.
    pub cameras: Vec<CameraConfig>,
    pub rejected: Vec<CameraRejection>,
    pub event_db_path: Option<String>,
    pub snapshot_dir: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
}

impl SmokewatchConfig {
    /// Load from `SMOKEWATCH_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SMOKEWATCH_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SmokewatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.source_path = path.map(Path::to_path_buf);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }

    fn from_file(file: SmokewatchConfigFile) -> Result<Self> {
        let detection = resolve_detection(file.detection.unwrap_or_default())?;
        let mut cameras = Vec::new();
        let mut rejected = Vec::new();
        for (index, camera) in file.cameras.unwrap_or_default().into_iter().enumerate() {
            let label = camera
                .id
                .clone()
                .unwrap_or_else(|| format!("cameras[{}]", index));
            match resolve_camera(camera) {
                Ok(camera) => cameras.push(camera),
                Err(e) => rejected.push(CameraRejection {
                    camera_id: label,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(Self {
            detection,
            cameras,
            rejected,
            event_db_path: file.events.and_then(|events| events.db_path),
            snapshot_dir: file.snapshots.and_then(|snapshots| snapshots.dir),
            source_path: None,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("SMOKEWATCH_SENSITIVITY") {
            self.detection.sensitivity = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("SMOKEWATCH_SENSITIVITY must be an integer"))?;
        }
        if let Ok(value) = std::env::var("SMOKEWATCH_MOTION_THRESHOLD") {
            self.detection.motion_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("SMOKEWATCH_MOTION_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("SMOKEWATCH_SLIDING_WINDOW") {
            self.detection.sliding_window = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("SMOKEWATCH_SLIDING_WINDOW must be an integer"))?;
        }
        if let Ok(path) = std::env::var("SMOKEWATCH_EVENT_DB") {
            if !path.trim().is_empty() {
                self.event_db_path = Some(path);
            }
        }
        if let Ok(dir) = std::env::var("SMOKEWATCH_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = Some(PathBuf::from(dir));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detection.validate()?;

        let mut seen = HashSet::new();
        let mut enabled = 0usize;
        let mut accepted = Vec::with_capacity(self.cameras.len());
        for camera in std::mem::take(&mut self.cameras) {
            let verdict = if !seen.insert(camera.id.clone()) {
                Err(anyhow!("duplicate camera id {}", camera.id))
            } else if camera.enabled && enabled >= crate::MAX_CAMERAS {
                Err(anyhow!(
                    "camera {} exceeds the maximum of {} enabled cameras",
                    camera.id,
                    crate::MAX_CAMERAS
                ))
            } else {
                camera.validate(&self.detection)
            };
            match verdict {
                Ok(()) => {
                    if camera.enabled {
                        enabled += 1;
                    }
                    accepted.push(camera);
                }
                Err(e) => self.rejected.push(CameraRejection {
                    camera_id: camera.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        self.cameras = accepted;

        for rejection in &self.rejected {
            log::warn!(
                "config: camera {} rejected: {}",
                rejection.camera_id,
                rejection.reason
            );
        }
        Ok(())
    }
}

fn resolve_detection(file: DetectionConfigFile) -> Result<DetectionSettings> {
    let defaults = DetectionSettings::default();
    let schedule_file = file.schedule.unwrap_or_default();
    let schedule = DetectionSchedule::parse(
        schedule_file.enabled.unwrap_or(false),
        schedule_file
            .start
            .as_deref()
            .unwrap_or(DEFAULT_SCHEDULE_START),
        schedule_file.end.as_deref().unwrap_or(DEFAULT_SCHEDULE_END),
    )?;
    Ok(DetectionSettings {
        sliding_window: file.sliding_window.unwrap_or(defaults.sliding_window),
        sensitivity: file.sensitivity.unwrap_or(defaults.sensitivity),
        motion_threshold: file.motion_threshold.unwrap_or(defaults.motion_threshold),
        sleep_time: file.sleep_time.unwrap_or(defaults.sleep_time),
        histogram_bins: file.histogram_bins.unwrap_or(defaults.histogram_bins),
        entry_frames: file.entry_frames.unwrap_or(defaults.entry_frames),
        exit_frames: file.exit_frames.unwrap_or(defaults.exit_frames),
        baseline_refresh_frames: file
            .baseline_refresh_frames
            .unwrap_or(defaults.baseline_refresh_frames),
        history_frames: file.history_frames.unwrap_or(defaults.history_frames),
        motion_count_threshold: file
            .motion_count_threshold
            .unwrap_or(defaults.motion_count_threshold),
        frame_timeout_ms: file.frame_timeout_ms.unwrap_or(defaults.frame_timeout_ms),
        backoff_initial_ms: file
            .backoff_initial_ms
            .unwrap_or(defaults.backoff_initial_ms),
        backoff_max_ms: file.backoff_max_ms.unwrap_or(defaults.backoff_max_ms),
        detection_enabled: file.detection_enabled.unwrap_or(defaults.detection_enabled),
        schedule,
    })
}

fn resolve_camera(file: CameraConfigFile) -> Result<CameraConfig> {
    let id = file
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| anyhow!("camera entry has no id"))?;
    let url = match (file.url, file.ip) {
        (Some(url), _) if !url.trim().is_empty() => url,
        (_, Some(ip)) if !ip.trim().is_empty() => {
            let username = file
                .username
                .unwrap_or_else(|| DEFAULT_CAMERA_USERNAME.to_string());
            let password = file.password.unwrap_or_default();
            let stream_path = file
                .stream_path
                .unwrap_or_else(|| DEFAULT_STREAM_PATH.to_string());
            rtsp_url(
                &ip,
                file.port.unwrap_or(DEFAULT_CAMERA_PORT),
                &username,
                &password,
                &stream_path,
            )
        }
        _ => return Err(anyhow!("camera {} needs either url or ip", id)),
    };
    Ok(CameraConfig {
        name: file.name.unwrap_or_else(|| id.clone()),
        id,
        url,
        target_fps: file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
        frame_width: file.frame_width.unwrap_or(DEFAULT_FRAME_WIDTH),
        frame_height: file.frame_height.unwrap_or(DEFAULT_FRAME_HEIGHT),
        enabled: file.enabled.unwrap_or(true),
    })
}

fn rtsp_url(ip: &str, port: u16, username: &str, password: &str, stream_path: &str) -> String {
    let path = if stream_path.starts_with('/') {
        stream_path.to_string()
    } else {
        format!("/{}", stream_path)
    };
    let credentials = match (username.is_empty(), password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", username),
        (false, false) => format!("{}:{}@", username, password),
    };
    format!("rtsp://{}{}:{}{}", credentials, ip, port, path)
}

/// TOML for `.toml` files, JSON otherwise.
fn read_config_file(path: &Path) -> Result<SmokewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = DetectionSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.trigger_threshold(), 6);
    }

    #[test]
    fn rejects_bad_global_settings() {
        let bad = [
            DetectionSettings {
                sliding_window: 0,
                ..DetectionSettings::default()
            },
            DetectionSettings {
                sensitivity: 11,
                ..DetectionSettings::default()
            },
            DetectionSettings {
                motion_threshold: f32::NAN,
                ..DetectionSettings::default()
            },
            DetectionSettings {
                entry_frames: 1,
                ..DetectionSettings::default()
            },
            DetectionSettings {
                entry_frames: 4,
                exit_frames: 3,
                ..DetectionSettings::default()
            },
            DetectionSettings {
                backoff_initial_ms: 1_000,
                backoff_max_ms: 10,
                ..DetectionSettings::default()
            },
        ];
        for settings in bad {
            assert!(settings.validate().is_err(), "{:?}", settings);
        }
    }

    #[test]
    fn frame_interval_falls_back_to_sleep_time() {
        let settings = DetectionSettings::default();
        assert_eq!(settings.frame_interval(4.0), Duration::from_millis(250));
        assert_eq!(settings.frame_interval(0.0), Duration::from_secs(1));
    }

    #[test]
    fn camera_url_from_components() -> Result<()> {
        let camera = resolve_camera(CameraConfigFile {
            id: Some("gate".to_string()),
            ip: Some("10.0.0.7".to_string()),
            password: Some("pw".to_string()),
            ..CameraConfigFile::default()
        })?;
        assert_eq!(
            camera.url,
            "rtsp://admin:pw@10.0.0.7:554/cam/realmonitor?channel=1&subtype=1"
        );
        assert_eq!(camera.name, "gate");
        assert!(resolve_camera(CameraConfigFile {
            id: Some("gate".to_string()),
            ..CameraConfigFile::default()
        })
        .is_err());
        Ok(())
    }

    #[test]
    fn camera_validation() {
        let settings = DetectionSettings::default();
        assert!(CameraConfig::new("cam-1", "stub://a").validate(&settings).is_ok());
        assert!(CameraConfig::new("cam 1", "stub://a").validate(&settings).is_err());
        assert!(CameraConfig::new("cam-1", "stub://a")
            .with_dimensions(0, 10)
            .validate(&settings)
            .is_err());
        assert!(CameraConfig::new("cam-1", "stub://a")
            .with_dimensions(8, 8)
            .validate(&settings)
            .is_err());
        assert!(CameraConfig::new("cam-1", "stub://a")
            .with_target_fps(-1.0)
            .validate(&settings)
            .is_err());
    }

    #[test]
    fn settings_handle_swaps_valid_snapshots_only() {
        let handle = SettingsHandle::default();
        let before = handle.load();
        assert!(handle
            .update(DetectionSettings {
                sliding_window: 0,
                ..DetectionSettings::default()
            })
            .is_err());
        assert!(Arc::ptr_eq(&before, &handle.load()));
        handle
            .update(DetectionSettings {
                sensitivity: 9,
                ..DetectionSettings::default()
            })
            .unwrap();
        assert_eq!(handle.load().sensitivity, 9);
        assert_eq!(before.sensitivity, DEFAULT_SENSITIVITY);
    }
}
