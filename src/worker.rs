//! Per-camera ingestion loop.
//!
//! A `CameraWorker` owns one camera's source connection, frame history and
//! detector. Each iteration:
//!
//! 1. (re)connects if needed, backing off exponentially on failure
//! 2. waits a bounded time for the next frame
//! 3. normalizes and buffers it, runs the detector, records transitions
//! 4. publishes status and artifacts for readers
//!
//! `run` paces iterations to the camera's frame interval. An iteration that
//! overruns the interval is followed immediately by the next one; frames are
//! never queued.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{CameraConfig, DetectionSettings, SettingsHandle};
use crate::detect::{
    render_set, ArtifactBoard, DetectionResult, DetectorPhase, DetectorState, RenderInput,
    SmokeDetector, Transition,
};
use crate::events::{EventKind, EventLog, EventRecord};
use crate::frame::{FrameBuffer, RawFrame};
use crate::ingest::{normalize_frame, to_rgb_image, FrameSource, SourceFactory};
use crate::schedule::detection_allowed_now;
use crate::snapshot::SnapshotWriter;

/// Longest uninterrupted sleep; bounds how long a stop request can go unnoticed.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FPS_SMOOTHING: f32 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Online,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraStatus {
    pub id: String,
    pub name: String,
    pub state: CameraState,
    /// Exponentially smoothed processing rate.
    pub fps: f32,
    pub last_frame_ms: Option<u64>,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub last_error: Option<String>,
    pub detecting: bool,
    pub phase: DetectorPhase,
}

impl CameraStatus {
    fn initial(camera: &CameraConfig) -> Self {
        Self {
            id: camera.id.clone(),
            name: camera.name.clone(),
            state: CameraState::Offline,
            fps: 0.0,
            last_frame_ms: None,
            frames_processed: 0,
            frames_dropped: 0,
            last_error: None,
            detecting: false,
            phase: DetectorPhase::Idle,
        }
    }
}

/// State a worker shares with readers and its supervisor.
pub struct WorkerShared {
    camera_id: String,
    status: ArcSwap<CameraStatus>,
    artifacts: ArtifactBoard,
    buffer: FrameBuffer,
    stop: AtomicBool,
}

impl WorkerShared {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn status(&self) -> Arc<CameraStatus> {
        self.status.load_full()
    }

    pub fn artifacts(&self) -> &ArtifactBoard {
        &self.artifacts
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Default)]
struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    fn next(&mut self, initial: Duration, max: Duration) -> Duration {
        let next = match self.current {
            None => initial,
            Some(current) => current.saturating_mul(2),
        }
        .min(max);
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A frame was normalized, buffered and (if enabled) evaluated.
    Processed,
    /// A frame arrived but could not be normalized.
    Dropped,
    /// No frame; wait `retry_in` before reconnecting.
    Offline { retry_in: Duration },
    Stopped,
}

pub struct CameraWorker {
    camera: Arc<CameraConfig>,
    settings: SettingsHandle,
    events: Arc<EventLog>,
    factory: SourceFactory,
    shared: Arc<WorkerShared>,
    detector: SmokeDetector,
    source: Option<Box<dyn FrameSource>>,
    backoff: Backoff,
    reported: Option<CameraState>,
    /// An error event went out for the current run of malformed frames.
    malformed_reported: bool,
    detection_window_open: Option<bool>,
    snapshots: Option<SnapshotWriter>,
    status: CameraStatus,
    last_frame_at: Option<Instant>,
}

impl CameraWorker {
    pub fn new(
        camera: Arc<CameraConfig>,
        settings: SettingsHandle,
        events: Arc<EventLog>,
        factory: SourceFactory,
    ) -> Result<Self> {
        let snapshot = settings.load();
        camera.validate(&snapshot)?;
        let buffer = FrameBuffer::new(snapshot.history_frames)?;
        let status = CameraStatus::initial(&camera);
        let shared = Arc::new(WorkerShared {
            camera_id: camera.id.clone(),
            status: ArcSwap::from_pointee(status.clone()),
            artifacts: ArtifactBoard::new(),
            buffer,
            stop: AtomicBool::new(false),
        });
        Ok(Self {
            detector: SmokeDetector::new(camera.id.clone()),
            camera,
            settings,
            events,
            factory,
            shared,
            source: None,
            backoff: Backoff::default(),
            reported: None,
            malformed_reported: false,
            detection_window_open: None,
            snapshots: None,
            status,
            last_frame_at: None,
        })
    }

    /// Write snapshot files on every detection start.
    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn camera(&self) -> &Arc<CameraConfig> {
        &self.camera
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    pub fn detector_state(&self) -> &DetectorState {
        self.detector.state()
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("camera-{}", self.camera.id))
            .spawn(move || self.run())
            .context("spawn camera worker thread")
    }

    /// Loop until a stop is requested, then release the source.
    pub fn run(mut self) {
        log::info!(
            "CameraWorker[{}]: started ({})",
            self.camera.id,
            crate::ingest::redact_credentials(&self.camera.url)
        );
        loop {
            let started = Instant::now();
            let interval = self.settings.load().frame_interval(self.camera.target_fps);
            match self.run_once() {
                IterationOutcome::Stopped => break,
                IterationOutcome::Offline { retry_in } => self.sleep(retry_in),
                IterationOutcome::Processed | IterationOutcome::Dropped => {
                    let elapsed = started.elapsed();
                    if elapsed < interval {
                        self.sleep(interval - elapsed);
                    } else {
                        log::debug!(
                            "CameraWorker[{}]: iteration took {} ms (interval {} ms), not sleeping",
                            self.camera.id,
                            elapsed.as_millis(),
                            interval.as_millis()
                        );
                    }
                }
            }
        }
        self.shutdown();
    }

    /// One iteration of the loop, without pacing.
    pub fn run_once(&mut self) -> IterationOutcome {
        if self.shared.stop_requested() {
            return IterationOutcome::Stopped;
        }
        let settings = self.settings.load();

        if self.source.is_none() {
            if let Err(reason) = self.connect() {
                return self.go_offline(&settings, reason);
            }
        }
        let next = match self.source.as_mut() {
            Some(source) => source.next_frame(settings.frame_timeout()),
            None => return self.go_offline(&settings, "source unavailable".to_string()),
        };
        match next {
            Ok(raw) => {
                self.backoff.reset();
                self.process_frame(raw, &settings)
            }
            Err(err) => {
                self.drop_source();
                self.go_offline(&settings, err.to_string())
            }
        }
    }

    fn connect(&mut self) -> std::result::Result<(), String> {
        let mut source = (self.factory)(self.camera.as_ref()).map_err(|e| format!("{:#}", e))?;
        source.connect().map_err(|e| e.to_string())?;
        log::info!(
            "CameraWorker[{}]: source {} connected",
            self.camera.id,
            source.describe()
        );
        self.source = Some(source);
        Ok(())
    }

    fn drop_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.disconnect();
        }
    }

    fn go_offline(&mut self, settings: &DetectionSettings, reason: String) -> IterationOutcome {
        let retry_in = self
            .backoff
            .next(settings.backoff_initial(), settings.backoff_max());
        log::warn!(
            "CameraWorker[{}]: offline ({}), retrying in {} ms",
            self.camera.id,
            reason,
            retry_in.as_millis()
        );
        if self.reported != Some(CameraState::Offline) {
            self.events.record(EventRecord::new(
                EventKind::CameraOffline,
                self.camera.id.clone(),
                reason.clone(),
            ));
            self.reported = Some(CameraState::Offline);
        }
        self.status.state = CameraState::Offline;
        self.status.fps = 0.0;
        self.status.last_error = Some(reason);
        self.last_frame_at = None;
        self.publish_status();
        IterationOutcome::Offline { retry_in }
    }

    fn mark_online(&mut self) {
        if self.reported != Some(CameraState::Online) {
            let description = self
                .source
                .as_ref()
                .map(|s| s.describe())
                .unwrap_or_default();
            self.events.record(EventRecord::new(
                EventKind::CameraOnline,
                self.camera.id.clone(),
                format!("receiving frames from {}", description),
            ));
            self.reported = Some(CameraState::Online);
        }
        self.status.state = CameraState::Online;
    }

    fn process_frame(&mut self, raw: RawFrame, settings: &DetectionSettings) -> IterationOutcome {
        let (width, height) = (self.camera.frame_width, self.camera.frame_height);
        let frame = match normalize_frame(&raw, &self.camera.id, width, height) {
            Ok(frame) => frame,
            Err(e) => {
                let reason = format!("dropped frame: {:#}", e);
                log::warn!("CameraWorker[{}]: {}", self.camera.id, reason);
                if !self.malformed_reported {
                    self.events.record(EventRecord::new(
                        EventKind::Error,
                        self.camera.id.clone(),
                        reason.clone(),
                    ));
                    self.malformed_reported = true;
                }
                self.status.frames_dropped += 1;
                self.status.last_error = Some(reason);
                self.publish_status();
                return IterationOutcome::Dropped;
            }
        };
        let original = match to_rgb_image(&raw, width, height) {
            Ok(image) => Some(image),
            Err(e) => {
                log::debug!("CameraWorker[{}]: no original artifact: {:#}", self.camera.id, e);
                None
            }
        };

        self.malformed_reported = false;
        self.mark_online();
        let timestamp_ms = frame.timestamp_ms();
        let frame_index = self.shared.buffer.push(frame);

        let (result, transition) = self.detect(settings);
        self.publish_artifacts(frame_index, original, result.as_ref(), settings);
        if let Some(transition) = transition {
            self.record_transition(&transition, result.as_ref(), settings);
        }

        self.update_rate();
        self.status.frames_processed += 1;
        self.status.last_frame_ms = Some(timestamp_ms);
        self.status.detecting = self.detector.state().detected();
        self.status.phase = self.detector.phase();
        self.publish_status();
        IterationOutcome::Processed
    }

    fn detect(
        &mut self,
        settings: &DetectionSettings,
    ) -> (Option<DetectionResult>, Option<Transition>) {
        let allowed = detection_allowed_now(settings);
        if self.detection_window_open != Some(allowed) {
            if self.detection_window_open.is_some() || !allowed {
                log::info!(
                    "CameraWorker[{}]: detection {}",
                    self.camera.id,
                    if allowed { "resumed" } else { "paused by schedule" }
                );
            }
            self.detection_window_open = Some(allowed);
        }
        if !allowed {
            return (None, None);
        }
        match self.detector.step(&self.shared.buffer, settings) {
            Ok(outcome) => (outcome.result, outcome.transition),
            Err(e) => {
                log::warn!(
                    "CameraWorker[{}]: detection step failed: {:#}",
                    self.camera.id,
                    e
                );
                self.status.last_error = Some(format!("detection step failed: {:#}", e));
                (None, None)
            }
        }
    }

    fn record_transition(
        &mut self,
        transition: &Transition,
        result: Option<&DetectionResult>,
        settings: &DetectionSettings,
    ) {
        let threshold = settings.trigger_threshold();
        let record = match transition {
            Transition::Started { aggregate } => EventRecord::new(
                EventKind::DetectionStart,
                self.camera.id.clone(),
                format!(
                    "smoke detected: {} active patches (trigger {})",
                    aggregate, threshold
                ),
            )
            .with_score(*aggregate as f64),
            Transition::Ended { aggregate } => EventRecord::new(
                EventKind::DetectionEnd,
                self.camera.id.clone(),
                format!("smoke cleared: {} active patches", aggregate),
            )
            .with_score(*aggregate as f64),
        };
        let record = match result {
            Some(result) => record.at(result.timestamp_ms),
            None => record,
        };
        self.events.record(record);

        if let (Transition::Started { .. }, Some(writer)) = (transition, &self.snapshots) {
            let artifacts = self.shared.artifacts.snapshot();
            match writer.write_detection(&self.camera.id, artifacts.timestamp_ms, &artifacts) {
                Ok(paths) => {
                    for path in paths {
                        log::info!(
                            "CameraWorker[{}]: snapshot written to {}",
                            self.camera.id,
                            path.display()
                        );
                    }
                }
                Err(e) => log::warn!(
                    "CameraWorker[{}]: snapshot failed: {:#}",
                    self.camera.id,
                    e
                ),
            }
        }
    }

    fn publish_artifacts(
        &self,
        frame_index: u64,
        original: Option<image::RgbImage>,
        result: Option<&DetectionResult>,
        settings: &DetectionSettings,
    ) {
        let Some(current) = self.shared.buffer.current() else {
            return;
        };
        let baseline = self.shared.buffer.baseline();
        let rendered = render_set(RenderInput {
            frame_index,
            original,
            current: &current,
            baseline: baseline.as_deref(),
            result,
            motion_threshold: settings.motion_threshold,
        });
        match rendered {
            Ok(set) => self.shared.artifacts.publish(set),
            Err(e) => log::warn!(
                "CameraWorker[{}]: artifact rendering failed: {:#}",
                self.camera.id,
                e
            ),
        }
    }

    fn update_rate(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_frame_at {
            let dt = now.duration_since(previous).as_secs_f32();
            if dt > 0.0 {
                let instant = 1.0 / dt;
                self.status.fps = if self.status.fps == 0.0 {
                    instant
                } else {
                    self.status.fps * (1.0 - FPS_SMOOTHING) + instant * FPS_SMOOTHING
                };
            }
        }
        self.last_frame_at = Some(now);
    }

    fn publish_status(&self) {
        self.shared.status.store(Arc::new(self.status.clone()));
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shared.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }

    fn shutdown(&mut self) {
        self.drop_source();
        self.status.state = CameraState::Offline;
        self.status.fps = 0.0;
        self.publish_status();
        log::info!(
            "CameraWorker[{}]: stopped after {} frames",
            self.camera.id,
            self.status.frames_processed
        );
    }
}
