//! Per-camera smoke detector.
//!
//! Each step compares the current frame against the baseline patch by patch,
//! counts the active patches, and feeds the resulting per-frame decision into
//! a debounced IDLE/ALERT state machine:
//!
//! - IDLE -> ALERT after `entry_frames` consecutive detecting frames
//! - ALERT -> IDLE after `exit_frames` consecutive quiet frames
//!
//! The baseline is never refreshed while ALERT or while a detecting streak is
//! pending, so it cannot drift toward smoke.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;

use super::distance::{try_mean_diff, try_wasserstein, PatchError};
use super::motion::{count_changed_pixels, is_global_disturbance};
use super::patch::{compute, PatchCoord, PatchGrid, PatchStatistics};
use crate::config::DetectionSettings;
use crate::frame::{FrameBuffer, GrayFrame};

pub const MIN_SENSITIVITY: u32 = 1;
pub const MAX_SENSITIVITY: u32 = 10;
/// Single-frame spikes never start an episode.
pub const MIN_ENTRY_FRAMES: u32 = 2;

/// Active patches needed for a frame to count as detecting.
///
/// `sensitivity` 10 triggers on one active patch, `sensitivity` 1 needs ten.
/// Out-of-range values are clamped.
pub fn trigger_threshold(sensitivity: u32) -> u32 {
    MAX_SENSITIVITY + 1 - sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorPhase {
    #[default]
    Idle,
    Alert,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatchScore {
    pub coord: PatchCoord,
    pub wasserstein: f32,
    pub mean_diff: f32,
    pub active: bool,
    pub failed: bool,
}

/// Outcome of comparing one frame against the baseline.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub timestamp_ms: u64,
    pub grid: PatchGrid,
    pub scores: Vec<PatchScore>,
    /// Active patch count after suppression.
    pub aggregate: u32,
    pub trigger_threshold: u32,
    pub detected: bool,
    pub active_patches: u32,
    pub failed_patches: u32,
    pub suppressed: bool,
}

impl DetectionResult {
    /// Score of the patch at `coord`. `scores` is in row-major grid order.
    pub fn score(&self, coord: PatchCoord) -> Option<&PatchScore> {
        let index = coord.row as usize * self.grid.cols() as usize + coord.col as usize;
        match self.scores.get(index) {
            Some(score) if score.coord == coord => Some(score),
            _ => self
                .scores
                .binary_search_by_key(&coord, |s| s.coord)
                .ok()
                .map(|i| &self.scores[i]),
        }
    }

    pub fn max_wasserstein(&self) -> f32 {
        self.scores.iter().map(|s| s.wasserstein).fold(0.0, f32::max)
    }

    pub fn max_mean_diff(&self) -> f32 {
        self.scores.iter().map(|s| s.mean_diff).fold(0.0, f32::max)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectorState {
    pub phase: DetectorPhase,
    pub consecutive_hits: u32,
    pub consecutive_misses: u32,
    pub frames_evaluated: u64,
    /// Accepted-frame count at the last baseline refresh.
    pub last_baseline_refresh: u64,
    pub suppressed_frames: u64,
    pub episodes: u64,
}

impl DetectorState {
    pub fn detected(&self) -> bool {
        self.phase == DetectorPhase::Alert
    }

    /// Baseline refresh is held off during an episode and during a pending streak.
    pub fn baseline_locked(&self) -> bool {
        self.phase == DetectorPhase::Alert || self.consecutive_hits > 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Started { aggregate: u32 },
    Ended { aggregate: u32 },
}

#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub result: Option<DetectionResult>,
    pub transition: Option<Transition>,
    pub baseline_refreshed: bool,
}

pub struct SmokeDetector {
    camera_id: String,
    state: DetectorState,
}

impl SmokeDetector {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            state: DetectorState::default(),
        }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn phase(&self) -> DetectorPhase {
        self.state.phase
    }

    /// Score `current` against `baseline` without touching the state machine.
    pub fn evaluate(
        &self,
        current: &GrayFrame,
        baseline: &GrayFrame,
        settings: &DetectionSettings,
    ) -> Result<DetectionResult> {
        if !current.same_shape(baseline) {
            return Err(anyhow!(
                "SmokeDetector[{}]: frame {}x{} does not match baseline {}x{}",
                self.camera_id,
                current.width(),
                current.height(),
                baseline.width(),
                baseline.height()
            ));
        }
        let grid = PatchGrid::for_frame(current, settings.sliding_window)?;
        let current_stats = compute(current, &grid, settings.histogram_bins)?;
        let baseline_stats = compute(baseline, &grid, settings.histogram_bins)?;
        let threshold = trigger_threshold(settings.sensitivity);

        let scores = score_patches(&current_stats, &baseline_stats, settings.motion_threshold);
        let active_patches = scores.iter().filter(|s| s.active).count() as u32;
        let failed_patches = scores.iter().filter(|s| s.failed).count() as u32;
        if failed_patches > 0 {
            log::warn!(
                "SmokeDetector[{}]: {} patches failed scoring and count as inactive",
                self.camera_id,
                failed_patches
            );
        }

        let mut suppressed = false;
        if settings.motion_count_threshold > 0 && active_patches > 0 {
            let changed = count_changed_pixels(current, baseline, settings.motion_threshold);
            if is_global_disturbance(changed, settings.motion_count_threshold) {
                log::info!(
                    "SmokeDetector[{}]: suppressing frame, {} pixels changed (limit {})",
                    self.camera_id,
                    changed,
                    settings.motion_count_threshold
                );
                suppressed = true;
            }
        }

        let aggregate = if suppressed { 0 } else { active_patches };
        Ok(DetectionResult {
            timestamp_ms: current.timestamp_ms(),
            grid,
            scores,
            aggregate,
            trigger_threshold: threshold,
            detected: aggregate >= threshold,
            active_patches,
            failed_patches,
            suppressed,
        })
    }

    /// Run one detection step on the buffer's newest frame.
    ///
    /// An empty buffer or a missing baseline is a warm-up no-op.
    pub fn step(
        &mut self,
        buffer: &FrameBuffer,
        settings: &DetectionSettings,
    ) -> Result<StepOutcome> {
        let Some((current, baseline)) = buffer.pair() else {
            return Ok(StepOutcome::default());
        };
        let result = self.evaluate(&current, &baseline, settings)?;
        let transition = self.apply(&result, settings);

        let baseline_refreshed = buffer
            .maybe_refresh_baseline(self.state.baseline_locked(), settings.baseline_refresh_frames);
        if baseline_refreshed {
            self.state.last_baseline_refresh = buffer.accepted();
            log::debug!(
                "SmokeDetector[{}]: baseline refreshed at frame {}",
                self.camera_id,
                self.state.last_baseline_refresh
            );
        }

        Ok(StepOutcome {
            result: Some(result),
            transition,
            baseline_refreshed,
        })
    }

    /// Feed one frame decision into the state machine.
    pub fn apply(
        &mut self,
        result: &DetectionResult,
        settings: &DetectionSettings,
    ) -> Option<Transition> {
        let entry = settings.effective_entry_frames();
        let exit = settings.effective_exit_frames();

        self.state.frames_evaluated += 1;
        if result.suppressed {
            self.state.suppressed_frames += 1;
        }
        if result.detected {
            self.state.consecutive_hits += 1;
            self.state.consecutive_misses = 0;
        } else {
            self.state.consecutive_misses += 1;
            self.state.consecutive_hits = 0;
        }
        log::debug!(
            "SmokeDetector[{}]: aggregate={} threshold={} hits={} misses={}",
            self.camera_id,
            result.aggregate,
            result.trigger_threshold,
            self.state.consecutive_hits,
            self.state.consecutive_misses
        );

        match self.state.phase {
            DetectorPhase::Idle if self.state.consecutive_hits >= entry => {
                self.state.phase = DetectorPhase::Alert;
                self.state.episodes += 1;
                log::info!(
                    "SmokeDetector[{}]: smoke detected ({} active patches)",
                    self.camera_id,
                    result.aggregate
                );
                Some(Transition::Started {
                    aggregate: result.aggregate,
                })
            }
            DetectorPhase::Alert if self.state.consecutive_misses >= exit => {
                self.state.phase = DetectorPhase::Idle;
                log::info!("SmokeDetector[{}]: smoke cleared", self.camera_id);
                Some(Transition::Ended {
                    aggregate: result.aggregate,
                })
            }
            _ => None,
        }
    }
}

fn score_patches(
    current: &BTreeMap<PatchCoord, PatchStatistics>,
    baseline: &BTreeMap<PatchCoord, PatchStatistics>,
    motion_threshold: f32,
) -> Vec<PatchScore> {
    current
        .iter()
        .map(|(&coord, cur)| {
            let scored = baseline
                .get(&coord)
                .ok_or(PatchError::EmptyPatch)
                .and_then(|base| Ok((try_wasserstein(cur, base)?, try_mean_diff(cur, base)?)));
            match scored {
                Ok((wasserstein, mean_diff)) => PatchScore {
                    coord,
                    wasserstein,
                    mean_diff,
                    active: wasserstein >= motion_threshold || mean_diff >= motion_threshold,
                    failed: false,
                },
                Err(err) => {
                    log::debug!("patch ({}, {}) not scored: {}", coord.row, coord.col, err);
                    PatchScore {
                        coord,
                        wasserstein: 0.0,
                        mean_diff: 0.0,
                        active: false,
                        failed: true,
                    }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 32;
    const H: u32 = 32;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            sliding_window: 8,
            sensitivity: 8,
            motion_threshold: 40.0,
            entry_frames: 2,
            exit_frames: 3,
            baseline_refresh_frames: 0,
            ..DetectionSettings::default()
        }
    }

    /// Background frame with the top-left `n` x `n` patch block brightened.
    fn scene(patches: u32, ts: u64) -> GrayFrame {
        let mut pixels = vec![60u8; (W * H) as usize];
        let extent = patches * 8;
        for y in 0..extent.min(H) {
            for x in 0..extent.min(W) {
                pixels[(y * W + x) as usize] = 180;
            }
        }
        GrayFrame::new("cam-1", W, H, pixels, ts).unwrap()
    }

    fn feed(detector: &mut SmokeDetector, buffer: &FrameBuffer, frame: GrayFrame) -> StepOutcome {
        buffer.push(frame);
        detector.step(buffer, &settings()).unwrap()
    }

    #[test]
    fn sensitivity_is_inverse_to_trigger_count() {
        assert_eq!(trigger_threshold(10), 1);
        assert_eq!(trigger_threshold(8), 3);
        assert_eq!(trigger_threshold(5), 6);
        assert_eq!(trigger_threshold(1), 10);
        assert_eq!(trigger_threshold(0), 10);
        assert_eq!(trigger_threshold(42), 1);
        for s in 1..MAX_SENSITIVITY {
            assert!(trigger_threshold(s) > trigger_threshold(s + 1));
        }
    }

    #[test]
    fn empty_buffer_is_skipped() {
        let mut detector = SmokeDetector::new("cam-1");
        let buffer = FrameBuffer::new(4).unwrap();
        let outcome = detector.step(&buffer, &settings()).unwrap();
        assert!(outcome.result.is_none());
        assert_eq!(detector.state().frames_evaluated, 0);
    }

    #[test]
    fn two_by_two_block_crosses_threshold() {
        let detector = SmokeDetector::new("cam-1");
        let result = detector
            .evaluate(&scene(2, 1), &scene(0, 0), &settings())
            .unwrap();
        assert_eq!(result.active_patches, 4);
        assert_eq!(result.aggregate, 4);
        assert_eq!(result.trigger_threshold, 3);
        assert!(result.detected);
        assert!(result.score(PatchCoord::new(0, 0)).unwrap().active);
        assert!(!result.score(PatchCoord::new(3, 3)).unwrap().active);
    }

    #[test]
    fn single_spike_does_not_start_episode() {
        let mut detector = SmokeDetector::new("cam-1");
        let buffer = FrameBuffer::new(4).unwrap();
        let mut transitions = Vec::new();
        for (i, patches) in [0, 0, 2, 0, 0, 2, 0].into_iter().enumerate() {
            transitions.extend(feed(&mut detector, &buffer, scene(patches, i as u64)).transition);
        }
        assert!(transitions.is_empty());
        assert_eq!(detector.phase(), DetectorPhase::Idle);
    }

    #[test]
    fn hysteresis_enters_and_leaves_once() {
        let mut detector = SmokeDetector::new("cam-1");
        let buffer = FrameBuffer::new(4).unwrap();
        let mut transitions = Vec::new();
        let sequence = [0, 0, 2, 2, 2, 0, 2, 0, 0, 0];
        for (i, patches) in sequence.into_iter().enumerate() {
            transitions.extend(feed(&mut detector, &buffer, scene(patches, i as u64)).transition);
        }
        assert_eq!(
            transitions,
            vec![
                Transition::Started { aggregate: 4 },
                Transition::Ended { aggregate: 0 }
            ]
        );
        assert_eq!(detector.phase(), DetectorPhase::Idle);
        assert_eq!(detector.state().episodes, 1);
    }

    #[test]
    fn exit_never_shorter_than_entry() {
        let mut detector = SmokeDetector::new("cam-1");
        let buffer = FrameBuffer::new(4).unwrap();
        let settings = DetectionSettings {
            entry_frames: 3,
            exit_frames: 1,
            ..settings()
        };
        let mut phases = Vec::new();
        for (i, patches) in [0, 2, 2, 2, 0, 0, 0].into_iter().enumerate() {
            buffer.push(scene(patches, i as u64));
            detector.step(&buffer, &settings).unwrap();
            phases.push(detector.phase());
        }
        use DetectorPhase::{Alert, Idle};
        assert_eq!(phases, vec![Idle, Idle, Idle, Alert, Alert, Alert, Idle]);
    }

    #[test]
    fn baseline_frozen_during_episode() {
        let mut detector = SmokeDetector::new("cam-1");
        let buffer = FrameBuffer::new(4).unwrap();
        let settings = DetectionSettings {
            baseline_refresh_frames: 1,
            ..settings()
        };
        let sequence = [0, 0, 2, 2, 2, 2, 0, 0, 0, 0];
        for (i, patches) in sequence.into_iter().enumerate() {
            let before = buffer.baseline();
            buffer.push(scene(patches, i as u64));
            let outcome = detector.step(&buffer, &settings).unwrap();
            if detector.state().baseline_locked() {
                assert!(!outcome.baseline_refreshed);
                if let Some(before) = before {
                    assert_eq!(buffer.baseline().unwrap().timestamp_ms(), before.timestamp_ms());
                }
            }
            if detector.phase() == DetectorPhase::Alert {
                assert_eq!(buffer.baseline().unwrap().pixels(), scene(0, 0).pixels());
            }
        }
        assert_eq!(detector.phase(), DetectorPhase::Idle);
    }

    #[test]
    fn global_disturbance_is_suppressed() {
        let detector = SmokeDetector::new("cam-1");
        let settings = DetectionSettings {
            motion_count_threshold: 300,
            ..settings()
        };
        let everything = GrayFrame::filled("cam-1", W, H, 250, 1).unwrap();
        let result = detector
            .evaluate(&everything, &scene(0, 0), &settings)
            .unwrap();
        assert!(result.suppressed);
        assert_eq!(result.aggregate, 0);
        assert!(!result.detected);

        let local = detector.evaluate(&scene(2, 1), &scene(0, 0), &settings).unwrap();
        assert!(!local.suppressed);
        assert!(local.detected);
    }

    #[test]
    fn score_lookup_covers_every_patch_of_a_full_size_grid() -> Result<()> {
        let detector = SmokeDetector::new("cam-1");
        let settings = DetectionSettings {
            sliding_window: 16,
            ..settings()
        };
        let frame = GrayFrame::filled("cam-1", 896, 504, 90, 1)?;
        let result = detector.evaluate(&frame, &frame, &settings)?;
        assert_eq!(result.scores.len(), 56 * 32);
        for rect in result.grid.rects() {
            assert_eq!(result.score(rect.coord).map(|s| s.coord), Some(rect.coord));
        }
        assert!(result.score(PatchCoord::new(32, 0)).is_none());
        Ok(())
    }

    #[test]
    fn failed_patch_does_not_abort_the_pass() -> Result<()> {
        let current = scene(2, 1);
        let grid = PatchGrid::for_frame(&current, 8)?;
        let current_stats = compute(&current, &grid, 32)?;
        let mut baseline_stats = compute(&scene(0, 0), &grid, 32)?;
        let missing = PatchCoord::new(0, 0);
        baseline_stats.remove(&missing);

        let scores = score_patches(&current_stats, &baseline_stats, 40.0);
        assert_eq!(scores.len(), grid.len());
        let failed: Vec<&PatchScore> = scores.iter().filter(|s| s.failed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].coord, missing);
        assert!(!failed[0].active);
        let active: Vec<PatchCoord> = scores.iter().filter(|s| s.active).map(|s| s.coord).collect();
        assert_eq!(
            active,
            vec![
                PatchCoord::new(0, 1),
                PatchCoord::new(1, 0),
                PatchCoord::new(1, 1)
            ]
        );
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let detector = SmokeDetector::new("cam-1");
        let small = GrayFrame::filled("cam-1", 8, 8, 0, 0).unwrap();
        assert!(detector.evaluate(&small, &scene(0, 0), &settings()).is_err());
    }
}
