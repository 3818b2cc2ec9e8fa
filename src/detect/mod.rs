mod artifacts;
mod detector;
mod distance;
mod motion;
mod patch;

pub use artifacts::{render_set, ArtifactBoard, ArtifactKind, ArtifactSet, RenderInput};
pub use detector::{
    trigger_threshold, DetectionResult, DetectorPhase, DetectorState, PatchScore, SmokeDetector,
    StepOutcome, Transition, MAX_SENSITIVITY, MIN_ENTRY_FRAMES, MIN_SENSITIVITY,
};
pub use distance::{mean_diff, try_mean_diff, try_wasserstein, wasserstein, PatchError};
pub use motion::{count_changed_pixels, is_global_disturbance};
pub use patch::{
    compute, validate_bins, PatchCoord, PatchGrid, PatchRect, PatchStatistics, INTENSITY_LEVELS,
};
