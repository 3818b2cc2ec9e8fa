//! Owns the set of running camera workers.
//!
//! The supervisor starts one worker thread per enabled camera, reconciles the
//! running set against a freshly loaded configuration, and serves status and
//! artifact reads without touching the workers' loops.

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::{CameraConfig, CameraRejection, SettingsHandle, SmokewatchConfig};
use crate::detect::{ArtifactKind, ArtifactSet};
use crate::events::{EventKind, EventLog, EventRecord};
use crate::ingest::SourceFactory;
use crate::snapshot::SnapshotWriter;
use crate::worker::{CameraStatus, CameraWorker, WorkerShared};

/// A running worker thread and the state it publishes.
pub struct WorkerHandle {
    camera: Arc<CameraConfig>,
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn status(&self) -> Arc<CameraStatus> {
        self.shared.status()
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// True once the thread has exited, whether asked to or not.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// Signal the worker and wait for its thread to exit.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.shared.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Supervisor: worker {} panicked", self.camera.id);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join();
    }
}

/// What `apply_config` changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
    /// Cameras that passed validation but whose worker could not start.
    pub failed: Vec<CameraRejection>,
    pub rejected: Vec<CameraRejection>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
            && self.failed.is_empty()
    }
}

pub struct Supervisor {
    settings: SettingsHandle,
    events: Arc<EventLog>,
    factory: SourceFactory,
    snapshots: Option<SnapshotWriter>,
    workers: BTreeMap<String, WorkerHandle>,
}

impl Supervisor {
    pub fn new(settings: SettingsHandle, events: Arc<EventLog>, factory: SourceFactory) -> Self {
        Self {
            settings,
            events,
            factory,
            snapshots: None,
            workers: BTreeMap::new(),
        }
    }

    /// Write detection snapshots below `dir` for workers started from now on.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots = Some(SnapshotWriter::new(dir));
        self
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn start(&mut self, camera: CameraConfig) -> Result<()> {
        if self.workers.contains_key(&camera.id) {
            return Err(anyhow!("camera {} is already running", camera.id));
        }
        let camera = Arc::new(camera);
        let mut worker = CameraWorker::new(
            Arc::clone(&camera),
            self.settings.clone(),
            Arc::clone(&self.events),
            Arc::clone(&self.factory),
        )
        .with_context(|| format!("camera {}", camera.id))?;
        if let Some(writer) = &self.snapshots {
            worker = worker.with_snapshots(writer.clone());
        }
        let shared = worker.shared();
        let thread = worker.spawn()?;
        log::info!("Supervisor: started camera {} ({})", camera.id, camera.name);
        self.workers.insert(
            camera.id.clone(),
            WorkerHandle {
                camera,
                shared,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    pub fn stop(&mut self, camera_id: &str) -> Result<()> {
        let handle = self
            .workers
            .remove(camera_id)
            .ok_or_else(|| anyhow!("unknown camera {}", camera_id))?;
        handle.stop();
        log::info!("Supervisor: stopped camera {}", camera_id);
        Ok(())
    }

    /// Stop and start a camera with its current configuration.
    pub fn restart(&mut self, camera_id: &str) -> Result<()> {
        let camera = self
            .workers
            .get(camera_id)
            .map(|handle| handle.camera().clone())
            .ok_or_else(|| anyhow!("unknown camera {}", camera_id))?;
        self.stop(camera_id)?;
        self.start(camera)
    }

    /// Swap in the configuration's detection settings and converge the
    /// running workers onto its enabled cameras.
    ///
    /// Fails without touching anything if the detection settings are invalid.
    pub fn apply_config(&mut self, config: &SmokewatchConfig) -> Result<ReconcileReport> {
        self.settings
            .update(config.detection.clone())
            .context("detection settings rejected")?;

        let mut report = ReconcileReport::default();
        let desired: BTreeMap<&str, &CameraConfig> = config
            .enabled_cameras()
            .map(|camera| (camera.id.as_str(), camera))
            .collect();

        let obsolete: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !desired.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in obsolete {
            self.stop(&id)?;
            report.stopped.push(id);
        }

        for (id, camera) in desired {
            let running = self.workers.get(id).map(|handle| handle.camera() == camera);
            let outcome = match running {
                Some(true) => {
                    report.unchanged.push(id.to_string());
                    continue;
                }
                Some(false) => {
                    self.stop(id)?;
                    self.start(camera.clone())
                        .map(|()| report.restarted.push(id.to_string()))
                }
                None => self
                    .start(camera.clone())
                    .map(|()| report.started.push(id.to_string())),
            };
            if let Err(e) = outcome {
                let reason = format!("{:#}", e);
                self.events.record(EventRecord::new(
                    EventKind::Error,
                    id,
                    format!("worker failed to start: {}", reason),
                ));
                report.failed.push(CameraRejection {
                    camera_id: id.to_string(),
                    reason,
                });
            }
        }

        for rejection in &config.rejected {
            self.events.record(EventRecord::new(
                EventKind::Error,
                rejection.camera_id.clone(),
                format!("camera rejected: {}", rejection.reason),
            ));
        }
        report.rejected = config.rejected.clone();

        log::info!(
            "Supervisor: config applied (started={}, stopped={}, restarted={}, unchanged={}, failed={}, rejected={})",
            report.started.len(),
            report.stopped.len(),
            report.restarted.len(),
            report.unchanged.len(),
            report.failed.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Restart workers whose thread exited without being asked to.
    pub fn revive_crashed(&mut self) -> Vec<String> {
        let crashed: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.is_finished() && !handle.shared().stop_requested())
            .map(|(id, _)| id.clone())
            .collect();
        let mut revived = Vec::new();
        for id in crashed {
            log::error!("Supervisor: worker {} exited unexpectedly, restarting", id);
            self.events.record(EventRecord::new(
                EventKind::Error,
                id.clone(),
                "worker exited unexpectedly",
            ));
            match self.restart(&id) {
                Ok(()) => revived.push(id),
                Err(e) => log::error!("Supervisor: restart of {} failed: {:#}", id, e),
            }
        }
        revived
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn worker(&self, camera_id: &str) -> Result<&WorkerHandle> {
        self.workers
            .get(camera_id)
            .ok_or_else(|| anyhow!("unknown camera {}", camera_id))
    }

    pub fn status(&self, camera_id: &str) -> Result<Arc<CameraStatus>> {
        Ok(self.worker(camera_id)?.status())
    }

    /// Status of every running camera, ordered by id.
    pub fn statuses(&self) -> Vec<Arc<CameraStatus>> {
        self.workers.values().map(WorkerHandle::status).collect()
    }

    /// Latest artifact of `kind`; `None` until the camera has produced one.
    pub fn artifact(
        &self,
        camera_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Arc<DynamicImage>>> {
        Ok(self.worker(camera_id)?.shared().artifacts().get(kind))
    }

    pub fn artifacts(&self, camera_id: &str) -> Result<Arc<ArtifactSet>> {
        Ok(self.worker(camera_id)?.shared().artifacts().snapshot())
    }

    /// Signal every worker first, then wait for each thread.
    pub fn stop_all(&mut self) {
        for handle in self.workers.values() {
            handle.request_stop();
        }
        let workers = std::mem::take(&mut self.workers);
        let count = workers.len();
        for (_, handle) in workers {
            handle.stop();
        }
        if count > 0 {
            log::info!("Supervisor: stopped {} camera workers", count);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionSettings;
    use crate::ingest::default_factory;
    use std::time::{Duration, Instant};

    fn settings() -> DetectionSettings {
        DetectionSettings {
            sliding_window: 8,
            sleep_time: 0.05,
            ..DetectionSettings::default()
        }
    }

    fn config(cameras: Vec<CameraConfig>) -> SmokewatchConfig {
        SmokewatchConfig {
            detection: settings(),
            cameras,
            rejected: Vec::new(),
            event_db_path: None,
            snapshot_dir: None,
            source_path: None,
        }
    }

    fn stub(id: &str) -> CameraConfig {
        CameraConfig::new(id, format!("stub://{}", id))
            .with_dimensions(32, 32)
            .with_target_fps(20.0)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn reconcile_starts_stops_and_restarts() -> Result<()> {
        let events = Arc::new(EventLog::in_memory());
        let mut supervisor =
            Supervisor::new(SettingsHandle::new(settings()), events, default_factory());

        let report = supervisor.apply_config(&config(vec![stub("a"), stub("b")]))?;
        assert_eq!(report.started, vec!["a", "b"]);
        assert_eq!(supervisor.camera_ids(), vec!["a", "b"]);

        let mut changed = stub("b");
        changed.target_fps = 10.0;
        let mut disabled = stub("a");
        disabled.enabled = false;
        let report = supervisor.apply_config(&config(vec![disabled, changed, stub("c")]))?;
        assert_eq!(report.stopped, vec!["a"]);
        assert_eq!(report.restarted, vec!["b"]);
        assert_eq!(report.started, vec!["c"]);
        assert_eq!(supervisor.camera_ids(), vec!["b", "c"]);
        assert!(supervisor.status("a").is_err());

        let report = supervisor.apply_config(&config(vec![stub("b"), stub("c")]))?;
        assert_eq!(report.restarted, vec!["b"]);
        let report = supervisor.apply_config(&config(vec![stub("b"), stub("c")]))?;
        assert!(report.is_noop());
        Ok(())
    }

    #[test]
    fn invalid_settings_leave_workers_untouched() -> Result<()> {
        let events = Arc::new(EventLog::in_memory());
        let mut supervisor =
            Supervisor::new(SettingsHandle::new(settings()), events, default_factory());
        supervisor.apply_config(&config(vec![stub("a")]))?;
        let mut bad = config(vec![]);
        bad.detection.sensitivity = 0;
        assert!(supervisor.apply_config(&bad).is_err());
        assert_eq!(supervisor.camera_ids(), vec!["a"]);
        assert_eq!(supervisor.settings().load().sensitivity, settings().sensitivity);
        Ok(())
    }

    #[test]
    fn serves_status_and_artifacts() -> Result<()> {
        let events = Arc::new(EventLog::in_memory());
        let mut supervisor =
            Supervisor::new(SettingsHandle::new(settings()), events, default_factory());
        supervisor.start(stub("a"))?;
        assert!(supervisor.start(stub("a")).is_err());
        assert!(wait_for(|| supervisor
            .status("a")
            .map(|s| s.frames_processed > 2)
            .unwrap_or(false)));
        assert!(supervisor.artifact("a", ArtifactKind::Current)?.is_some());
        assert!(supervisor.artifact("missing", ArtifactKind::Current).is_err());
        supervisor.stop("a")?;
        assert!(supervisor.stop("a").is_err());
        Ok(())
    }
}
